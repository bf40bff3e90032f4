// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Persisted recovery context for the OTA PAL (v1 binary format)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here + reboot scenarios in tests/ota_pal_host
//!
//! The recovery context is the only PAL state that survives a reset. It is a
//! three-byte fixed-layout record: format version, state tag, target bank.
//! It exists on stable storage exactly while a reset needs update-specific
//! interpretation (pending self-test, first boot observed, rollback pending);
//! a record that cannot be parsed is treated as "nothing to recover".
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

use std::path::PathBuf;

use log::warn;
use thiserror::Error;

use flash_hal::FlashBank;

use crate::pal::PalState;

/// Format version of the persisted record.
const CONTEXT_VERSION: u8 = 1;

/// Encoded record length: version + state tag + bank tag.
const CONTEXT_LEN: usize = 3;

/// Errors surfaced by the context store.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Underlying file primitive failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Backend rejected the operation for a non-I/O reason.
    #[error("context store error: {0}")]
    Backend(&'static str),
}

/// The persisted record interpreting a post-reset boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryContext {
    /// PAL state at the time the record was written. Only the states that
    /// require recovery after a reset are representable on the wire.
    pub state: PalState,
    /// The bank holding the candidate image.
    pub target_bank: FlashBank,
}

fn state_tag(state: PalState) -> u8 {
    match state {
        PalState::Ready => 1,
        PalState::FileOpen => 2,
        PalState::PendingActivation => 3,
        PalState::PendingSelfTest => 4,
        PalState::NewImageBooted => 5,
        PalState::NewImageWdtReset => 6,
        PalState::SelfTestFailed => 7,
        PalState::Accepted => 8,
        PalState::Rejected => 9,
    }
}

/// Decodes a state tag; only recovery-relevant states are accepted so a
/// stale or corrupt record loads as "nothing to recover".
fn state_from_tag(tag: u8) -> Option<PalState> {
    match tag {
        4 => Some(PalState::PendingSelfTest),
        5 => Some(PalState::NewImageBooted),
        6 => Some(PalState::NewImageWdtReset),
        7 => Some(PalState::SelfTestFailed),
        _ => None,
    }
}

fn bank_tag(bank: FlashBank) -> u8 {
    match bank {
        FlashBank::A => 1,
        FlashBank::B => 2,
    }
}

fn bank_from_tag(tag: u8) -> Option<FlashBank> {
    match tag {
        1 => Some(FlashBank::A),
        2 => Some(FlashBank::B),
        _ => None,
    }
}

impl RecoveryContext {
    fn encode(&self) -> [u8; CONTEXT_LEN] {
        [CONTEXT_VERSION, state_tag(self.state), bank_tag(self.target_bank)]
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CONTEXT_LEN || bytes[0] != CONTEXT_VERSION {
            return None;
        }
        let state = state_from_tag(bytes[1])?;
        let target_bank = bank_from_tag(bytes[2])?;
        Some(Self { state, target_bank })
    }
}

/// Persisted-file primitive the context store is built on.
///
/// Implementations provide whole-record read/overwrite/remove by path or
/// handle; the store owns the record layout.
pub trait ContextFile {
    /// Reads the record, or `None` if it does not exist.
    fn read(&mut self) -> Result<Option<Vec<u8>>, ContextError>;

    /// Overwrites the record. After a failed write the previous record may
    /// or may not remain; callers must go by this result alone.
    fn write(&mut self, bytes: &[u8]) -> Result<(), ContextError>;

    /// Removes the record. Removing a nonexistent record is success.
    fn remove(&mut self) -> Result<(), ContextError>;
}

/// Recovery context store over a [`ContextFile`] backend.
pub struct ContextStore<F> {
    file: F,
}

impl<F: ContextFile> ContextStore<F> {
    pub fn new(file: F) -> Self {
        Self { file }
    }

    /// Loads the persisted context. A missing or unparsable record is
    /// "nothing to recover", not an error.
    pub fn load(&mut self) -> Option<RecoveryContext> {
        match self.file.read() {
            Ok(Some(bytes)) => {
                let ctx = RecoveryContext::decode(&bytes);
                if ctx.is_none() {
                    warn!("recovery context unparsable ({} bytes); ignoring", bytes.len());
                }
                ctx
            }
            Ok(None) => None,
            Err(err) => {
                warn!("recovery context read failed: {err}; ignoring");
                None
            }
        }
    }

    /// Persists `ctx`, replacing any previous record.
    pub fn save(&mut self, ctx: &RecoveryContext) -> Result<(), ContextError> {
        self.file.write(&ctx.encode())
    }

    /// Deletes the persisted record.
    pub fn delete(&mut self) -> Result<(), ContextError> {
        self.file.remove()
    }

    /// Releases the backend, e.g. to carry it across a simulated reboot.
    pub fn into_file(self) -> F {
        self.file
    }
}

/// Context file on the host filesystem.
pub struct FsContextFile {
    path: PathBuf,
}

impl FsContextFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ContextFile for FsContextFile {
    fn read(&mut self) -> Result<Option<Vec<u8>>, ContextError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ContextError> {
        std::fs::write(&self.path, bytes).map_err(Into::into)
    }

    fn remove(&mut self) -> Result<(), ContextError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory context file for host testing, with write/remove fault
/// injection.
#[derive(Default)]
pub struct MemContextFile {
    record: Option<Vec<u8>>,
    fail_writes: bool,
    fail_removes: bool,
}

impl MemContextFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record currently exists.
    pub fn exists(&self) -> bool {
        self.record.is_some()
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn set_fail_removes(&mut self, fail: bool) {
        self.fail_removes = fail;
    }
}

impl ContextFile for MemContextFile {
    fn read(&mut self) -> Result<Option<Vec<u8>>, ContextError> {
        Ok(self.record.clone())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ContextError> {
        if self.fail_writes {
            return Err(ContextError::Backend("write fault injected"));
        }
        self.record = Some(bytes.to_vec());
        Ok(())
    }

    fn remove(&mut self) -> Result<(), ContextError> {
        if self.fail_removes {
            return Err(ContextError::Backend("remove fault injected"));
        }
        self.record = None;
        Ok(())
    }
}
