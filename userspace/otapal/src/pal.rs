// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: OTA update state machine (stage, verify, swap, self-test, commit)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here; full reboot cycles in tests/ota_pal_host
//!
//! PUBLIC API:
//!   - OtaPal: owns the flash device, recovery context store and key provider
//!   - Entry points: early_init, create_file, write_block, close_file,
//!     activate_image, set_image_state, get_image_state, abort
//!
//! Transitions that involve a reboot are split into a pre-reboot half (persist
//! the recovery context, commit the boot-bank selection, reset) and a
//! post-reboot half (early_init), joined only through the persisted
//! [`RecoveryContext`]. On real hardware `FlashDevice::reset` diverges, so
//! code after a reset call in the pre-reboot half is reachable only in
//! simulation and must not mutate state.
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

use core::fmt;

use log::{error, info, warn};
use thiserror::Error;

use flash_hal::{FlashBank, FlashDevice, FlashError, Watchdog};

use crate::config::PalConfig;
use crate::context::{ContextError, ContextFile, ContextStore, RecoveryContext};
use crate::flash;
use crate::verify::{self, KeyProvider, VerifyError};

/// Internal PAL state, including the states that only exist across a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalState {
    /// No update in progress.
    Ready,
    /// Inactive bank erased, accepting writes.
    FileOpen,
    /// Staged image verified, awaiting activation.
    PendingActivation,
    /// Context persisted, bank swap and reset requested.
    PendingSelfTest,
    /// First successful boot of the candidate; explicit accept pending.
    NewImageBooted,
    /// The candidate reset again before being accepted.
    NewImageWdtReset,
    /// Candidate rejected while it was live; rollback in progress.
    SelfTestFailed,
    /// Candidate committed as the new baseline.
    Accepted,
    /// Candidate discarded, original bank restored.
    Rejected,
}

impl fmt::Display for PalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PalState::Ready => "Ready",
            PalState::FileOpen => "File Open",
            PalState::PendingActivation => "Pending Activation",
            PalState::PendingSelfTest => "Pending Self Test",
            PalState::NewImageBooted => "New Image Booted",
            PalState::NewImageWdtReset => "Watchdog Reset",
            PalState::SelfTestFailed => "Self Test Failed",
            PalState::Accepted => "Accepted",
            PalState::Rejected => "Rejected",
        };
        f.write_str(name)
    }
}

/// Image state requested by the upstream agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Accepted,
    Rejected,
    Testing,
    Aborted,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageState::Accepted => "accepted",
            ImageState::Rejected => "rejected",
            ImageState::Testing => "testing",
            ImageState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Read-only projection of [`PalState`] reported to the upstream agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalImageState {
    Unknown,
    PendingCommit,
    Valid,
    Invalid,
}

/// Metadata describing one candidate image, supplied by the job layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    /// Logical identity of the image file.
    pub file_identity: String,
    /// Declared total size in bytes.
    pub declared_size: u32,
    /// Label of the public key the signature must verify against.
    pub certificate_reference: String,
    /// Detached `sig-sha256-ecdsa` signature over the image.
    pub signature: Vec<u8>,
}

/// Errors surfaced by the PAL entry points.
#[derive(Debug, Error)]
pub enum PalError {
    /// Boot-time recovery has not run yet.
    #[error("boot-time recovery has not run")]
    NotInitialized,
    /// The operation is not permitted in the current state.
    #[error("operation `{op}` invalid in state {state}")]
    InvalidState { op: &'static str, state: PalState },
    /// Declared size exceeds one bank.
    #[error("declared image size {size} exceeds bank capacity {capacity}")]
    ImageTooLarge { size: u32, capacity: u32 },
    /// Declared size is implausibly small.
    #[error("declared image size {size} below minimum {min}")]
    ImageTooSmall { size: u32, min: u32 },
    /// Image identity does not match the expected target.
    #[error("unexpected image identity `{identity}`")]
    UnknownImage { identity: String },
    /// Write would run past the declared image size.
    #[error("write of {len} bytes at offset {offset} exceeds image size {size}")]
    OutOfBounds { offset: u32, len: u32, size: u32 },
    /// Flash erase/program/read failure.
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),
    /// Recovery context persistence failure.
    #[error("recovery context error: {0}")]
    Context(#[from] ContextError),
    /// Digest or signature check failed; the image was rejected.
    #[error("image verification failed: {0}")]
    Verification(#[from] VerifyError),
}

/// Staged-image bookkeeping; valid only within the boot that created it.
#[derive(Debug)]
struct StagedImage {
    size: u32,
    meta: ImageMeta,
}

/// The update platform abstraction layer.
///
/// Owns the two flash banks (via the device), the recovery context record and
/// the verification key provider for the duration of an update cycle. All
/// entry points are called serially by a single upstream agent; state guards,
/// not locks, enforce ordering.
pub struct OtaPal<D, W, F, K> {
    device: D,
    watchdog: W,
    store: ContextStore<F>,
    keys: K,
    config: PalConfig,
    active_bank: FlashBank,
    state: PalState,
    target_bank: Option<FlashBank>,
    staged: Option<StagedImage>,
    initialized: bool,
}

impl<D, W, F, K> OtaPal<D, W, F, K>
where
    D: FlashDevice,
    W: Watchdog,
    F: ContextFile,
    K: KeyProvider,
{
    /// Builds the PAL for this boot. [`OtaPal::early_init`] must run before
    /// any other entry point.
    pub fn new(device: D, watchdog: W, context_file: F, keys: K, config: PalConfig) -> Self {
        let active_bank = device.boot_bank();
        Self {
            device,
            watchdog,
            store: ContextStore::new(context_file),
            keys,
            config,
            active_bank,
            state: PalState::Ready,
            target_bank: None,
            staged: None,
            initialized: false,
        }
    }

    /// The bank this boot is executing from.
    pub fn active_bank(&self) -> FlashBank {
        self.active_bank
    }

    /// The staging bank.
    pub fn inactive_bank(&self) -> FlashBank {
        self.active_bank.other()
    }

    /// Current internal state (diagnostics).
    pub fn state(&self) -> PalState {
        self.state
    }

    /// Releases the owned resources, e.g. to rebuild the PAL across a
    /// simulated reboot.
    pub fn into_parts(self) -> (D, W, F, K) {
        (self.device, self.watchdog, self.store.into_file(), self.keys)
    }

    /// Boot-time recovery. Runs exactly once per boot, before the agent task
    /// starts; calling it again in the same boot is a no-op.
    pub fn early_init(&mut self) -> Result<(), PalError> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;

        let Some(ctx) = self.store.load() else {
            self.state = PalState::Ready;
            info!("ota early init: no recovery context, state {}", self.state);
            return Ok(());
        };

        self.state = ctx.state;
        self.target_bank = Some(ctx.target_bank);
        info!(
            "ota early init: state {}, active {}, target {}",
            ctx.state, self.active_bank, ctx.target_bank
        );

        match ctx.state {
            PalState::PendingSelfTest => {
                if self.active_bank == ctx.target_bank {
                    // First boot of the candidate. Mark it observed; the
                    // application must still explicitly accept it.
                    self.state = PalState::NewImageBooted;
                    self.store.save(&RecoveryContext {
                        state: PalState::NewImageBooted,
                        target_bank: ctx.target_bank,
                    })?;
                } else {
                    // The reset fired before the bank swap took effect; the
                    // candidate never ran and cannot be trusted.
                    warn!(
                        "ota early init: swap to {} did not take effect, rolling back",
                        ctx.target_bank
                    );
                    self.finalize_rejection(ctx.target_bank)?;
                }
            }
            PalState::NewImageBooted => {
                // The previous boot reached the candidate but reset again
                // without an explicit accept: implicit self-test failure.
                self.state = PalState::NewImageWdtReset;
                self.store.save(&RecoveryContext {
                    state: PalState::NewImageWdtReset,
                    target_bank: ctx.target_bank,
                })?;
                error!(
                    "ota early init: reset during self-test, reverting to {}",
                    ctx.target_bank.other()
                );
                self.reboot_into(ctx.target_bank.other())?;
            }
            PalState::NewImageWdtReset | PalState::SelfTestFailed => {
                self.finalize_rejection(ctx.target_bank)?;
            }
            _ => {
                // Not representable in the wire format; drop the stale record.
                self.store.delete()?;
                self.state = PalState::Ready;
            }
        }

        info!("ota early init: ending state {}", self.state);
        Ok(())
    }

    /// Opens a staging cycle: validates the metadata, erases the inactive
    /// bank, and drops any stale recovery context.
    pub fn create_file(&mut self, meta: &ImageMeta) -> Result<(), PalError> {
        self.require_init()?;
        match self.state {
            PalState::Ready
            | PalState::FileOpen
            | PalState::PendingActivation
            | PalState::Accepted
            | PalState::Rejected => {}
            _ => return Err(self.invalid("create_file")),
        }

        let capacity = self.device.bank_size();
        if meta.declared_size > capacity {
            return Err(PalError::ImageTooLarge { size: meta.declared_size, capacity });
        }
        if meta.declared_size < self.config.min_image_size {
            return Err(PalError::ImageTooSmall {
                size: meta.declared_size,
                min: self.config.min_image_size,
            });
        }
        if meta.file_identity != self.config.expected_image_name {
            return Err(PalError::UnknownImage { identity: meta.file_identity.clone() });
        }

        let target = self.active_bank.other();
        flash::erase_bank(&mut self.device, &mut self.watchdog, target, self.active_bank)?;
        // A prior cycle's record must not bleed into this one.
        self.store.delete()?;

        self.target_bank = Some(target);
        self.staged = Some(StagedImage { size: meta.declared_size, meta: meta.clone() });
        self.state = PalState::FileOpen;
        info!(
            "ota stage open: {} ({} bytes) into {}",
            meta.file_identity, meta.declared_size, target
        );
        Ok(())
    }

    /// Writes one block of the staged image. Returns the number of bytes
    /// written. Never changes state.
    pub fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<usize, PalError> {
        self.require_init()?;
        if self.state != PalState::FileOpen {
            return Err(self.invalid("write_block"));
        }
        let Some(staged) = self.staged.as_ref() else {
            return Err(self.invalid("write_block"));
        };
        let end = offset as u64 + data.len() as u64;
        if end > staged.size as u64 {
            return Err(PalError::OutOfBounds {
                offset,
                len: data.len() as u32,
                size: staged.size,
            });
        }
        let Some(target) = self.target_bank else {
            return Err(self.invalid("write_block"));
        };
        assert!(target != self.active_bank, "staging bank must not be the active bank");

        flash::write_verified(&mut self.device, &mut self.watchdog, target, offset, data)?;
        Ok(data.len())
    }

    /// Seals the staged image: digests the full staged region and verifies
    /// the detached signature. No image may remain closed but unverified, so
    /// a failed check rejects the image before the error is returned.
    pub fn close_file(&mut self) -> Result<(), PalError> {
        self.require_init()?;
        if self.state != PalState::FileOpen {
            return Err(self.invalid("close_file"));
        }
        let (size, label, signature) = match self.staged.as_ref() {
            Some(staged) => (
                staged.size,
                staged.meta.certificate_reference.clone(),
                staged.meta.signature.clone(),
            ),
            None => return Err(self.invalid("close_file")),
        };
        let Some(target) = self.target_bank else {
            return Err(self.invalid("close_file"));
        };

        let digest = flash::digest_staged(&self.device, &mut self.watchdog, target, size)?;
        match verify::verify_image(&self.keys, &label, &digest, &signature) {
            Ok(()) => {
                self.state = PalState::PendingActivation;
                info!("ota stage sealed: image verified, sha256={}", hex::encode(digest));
                Ok(())
            }
            Err(err) => {
                error!("ota stage rejected: {err}");
                self.set_image_state(ImageState::Rejected)?;
                Err(PalError::Verification(err))
            }
        }
    }

    /// Activates a verified image: persists the recovery context, commits
    /// the boot-bank swap and resets. On hardware this does not return;
    /// control resumes in [`OtaPal::early_init`] on the next boot.
    pub fn activate_image(&mut self) -> Result<(), PalError> {
        self.require_init()?;
        if self.state != PalState::PendingActivation {
            return Err(self.invalid("activate_image"));
        }
        let Some(target) = self.target_bank else {
            return Err(self.invalid("activate_image"));
        };

        // The context must be durable before the swap: nothing between the
        // boot-configuration commit and the reset can be relied upon to run.
        self.store
            .save(&RecoveryContext { state: PalState::PendingSelfTest, target_bank: target })?;
        self.state = PalState::PendingSelfTest;
        info!("ota activate: swapping to {target} and resetting");
        self.reboot_into(target)
    }

    /// Applies an agent-requested image state.
    pub fn set_image_state(&mut self, desired: ImageState) -> Result<(), PalError> {
        self.require_init()?;
        info!("ota set image state: {desired} requested in state {}", self.state);
        match desired {
            ImageState::Accepted => self.accept(),
            ImageState::Rejected => self.reject(),
            ImageState::Testing => match self.state {
                PalState::NewImageBooted => Ok(()),
                _ => Err(self.invalid("testing")),
            },
            ImageState::Aborted => self.abort_cleanup(),
        }
    }

    /// Convenience wrapper for `set_image_state(Aborted)`.
    pub fn abort(&mut self) -> Result<(), PalError> {
        self.set_image_state(ImageState::Aborted)
    }

    /// Read-only projection of the internal state.
    pub fn get_image_state(&self) -> PalImageState {
        if !self.initialized {
            return PalImageState::Unknown;
        }
        match self.state {
            PalState::PendingActivation | PalState::PendingSelfTest | PalState::NewImageBooted => {
                PalImageState::PendingCommit
            }
            PalState::Accepted => PalImageState::Valid,
            PalState::Ready
            | PalState::FileOpen
            | PalState::Rejected
            | PalState::SelfTestFailed
            | PalState::NewImageWdtReset => PalImageState::Invalid,
        }
    }

    fn accept(&mut self) -> Result<(), PalError> {
        match self.state {
            PalState::NewImageBooted => {
                let Some(target) = self.target_bank else {
                    return Err(self.invalid("accept"));
                };
                assert!(
                    self.active_bank == target,
                    "accept requires running the candidate image"
                );
                // The single point where a candidate becomes permanent.
                self.store.delete()?;
                self.state = PalState::Accepted;
                info!("ota accept: {target} is the new baseline");
                Ok(())
            }
            PalState::Accepted => Ok(()),
            _ => Err(self.invalid("accept")),
        }
    }

    fn reject(&mut self) -> Result<(), PalError> {
        match self.state {
            PalState::PendingSelfTest | PalState::NewImageBooted => {
                // The device has already committed to (or is running) the
                // candidate; rollback is reboot-driven, mirroring activation.
                let Some(target) = self.target_bank else {
                    return Err(self.invalid("reject"));
                };
                self.state = PalState::SelfTestFailed;
                self.store.save(&RecoveryContext {
                    state: PalState::SelfTestFailed,
                    target_bank: target,
                })?;
                warn!("ota reject: self-test failed, rolling back to {}", target.other());
                self.reboot_into(target.other())
            }
            PalState::FileOpen | PalState::PendingActivation => {
                // The bad image was never booted; clean up in place.
                let Some(target) = self.target_bank else {
                    return Err(self.invalid("reject"));
                };
                flash::erase_bank(&mut self.device, &mut self.watchdog, target, self.active_bank)?;
                self.store.delete()?;
                self.staged = None;
                self.state = PalState::Rejected;
                info!("ota reject: candidate discarded without reboot");
                Ok(())
            }
            // Already rejected, or rollback is in flight; the post-reset
            // recovery owns the remaining teardown.
            PalState::SelfTestFailed | PalState::NewImageWdtReset | PalState::Rejected => Ok(()),
            _ => Err(self.invalid("reject")),
        }
    }

    fn abort_cleanup(&mut self) -> Result<(), PalError> {
        match self.state {
            // Nothing staged, or the device has already committed to a
            // reset; teardown past that point is owned by the reboot-driven
            // accept/reject paths and their recovery halves.
            PalState::Ready
            | PalState::Accepted
            | PalState::Rejected
            | PalState::SelfTestFailed
            | PalState::NewImageBooted
            | PalState::PendingSelfTest
            | PalState::NewImageWdtReset => Ok(()),
            PalState::FileOpen | PalState::PendingActivation => {
                let Some(target) = self.target_bank else {
                    return Err(self.invalid("abort"));
                };
                flash::erase_bank(&mut self.device, &mut self.watchdog, target, self.active_bank)?;
                self.store.delete()?;
                self.staged = None;
                self.target_bank = None;
                self.state = PalState::Ready;
                info!("ota abort: staging cycle cleaned up");
                Ok(())
            }
        }
    }

    fn finalize_rejection(&mut self, target: FlashBank) -> Result<(), PalError> {
        flash::erase_bank(&mut self.device, &mut self.watchdog, target, self.active_bank)?;
        self.store.delete()?;
        self.state = PalState::Rejected;
        info!("ota rollback complete: candidate erased, running {}", self.active_bank);
        Ok(())
    }

    /// Pre-reboot half of a reboot-driven transition. On hardware the reset
    /// diverges; the matching post-reboot half is `early_init`, reached only
    /// through the persisted recovery context.
    fn reboot_into(&mut self, bank: FlashBank) -> Result<(), PalError> {
        if bank != self.device.boot_bank() {
            self.device.set_boot_bank(bank)?;
        }
        info!("ota reset: next boot from {bank}");
        self.device.reset()?;
        Ok(())
    }

    fn require_init(&self) -> Result<(), PalError> {
        if self.initialized {
            Ok(())
        } else {
            Err(PalError::NotInitialized)
        }
    }

    fn invalid(&self, op: &'static str) -> PalError {
        PalError::InvalidState { op, state: self.state }
    }
}
