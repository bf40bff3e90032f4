// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Platform abstraction layer for dual-bank OTA firmware updates
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests per module + reboot scenarios in tests/ota_pal_host
//!
//! An update cycle stages a candidate image into the inactive flash bank,
//! verifies it (SHA-256 digest, ECDSA P-256 signature), swaps the boot bank
//! and resets into a bounded self-test window, then either commits the
//! candidate or rolls back to the previous image. Any reset that is not an
//! explicit accept resolves against the device: boot-time recovery reads the
//! persisted recovery context and finishes whichever half-done transition it
//! describes.
//!
//! PUBLIC API:
//!   - [`OtaPal`]: the state machine; see [`pal`]
//!   - [`PalConfig`]: image identity and size policy; see [`config`]
//!   - [`ContextFile`] / [`ContextStore`]: recovery context persistence
//!   - [`KeyProvider`] / [`verify`]: signature verification gate
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
mod flash;
pub mod pal;
pub mod verify;

pub use config::{ConfigError, PalConfig, DEFAULT_MIN_IMAGE_SIZE};
pub use context::{
    ContextError, ContextFile, ContextStore, FsContextFile, MemContextFile, RecoveryContext,
};
pub use pal::{ImageMeta, ImageState, OtaPal, PalError, PalImageState, PalState};
pub use verify::{DirKeyProvider, KeyProvider, MemKeyProvider, PublicKey, VerifyError};
