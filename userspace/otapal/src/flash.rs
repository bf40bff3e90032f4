// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bounded flash program/erase helpers with read-back verification
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here + write scenarios in tests/ota_pal_host
//!
//! Programming happens in 16-byte units; the final partial unit is padded
//! with 0xFF (the erased value). Every programmed unit is read back and
//! compared against the source. Erase, program, and digest loops service the
//! watchdog so a multi-hundred-millisecond flash operation is never mistaken
//! for a hang.
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

use sha2::{Digest, Sha256};

use flash_hal::{FlashBank, FlashDevice, FlashError, Watchdog};

/// Smallest programmable unit (quad-word on the reference part).
const PROGRAM_UNIT: usize = 16;

/// Read granularity while digesting a staged region.
const DIGEST_CHUNK: usize = 4096;

/// Erases `bank` in full.
///
/// Erasing the active bank would brick the device; that is a programming
/// error in the caller, not a recoverable condition.
pub(crate) fn erase_bank<D: FlashDevice, W: Watchdog>(
    device: &mut D,
    watchdog: &mut W,
    bank: FlashBank,
    active: FlashBank,
) -> Result<(), FlashError> {
    assert!(bank != active, "attempted to erase the active flash bank");
    watchdog.refresh();
    device.erase_bank(bank)?;
    watchdog.refresh();
    Ok(())
}

/// Programs `data` at `offset` within `bank`, one unit at a time, verifying
/// each unit by read-back.
pub(crate) fn write_verified<D: FlashDevice, W: Watchdog>(
    device: &mut D,
    watchdog: &mut W,
    bank: FlashBank,
    offset: u32,
    data: &[u8],
) -> Result<(), FlashError> {
    let mut unit = [0xFFu8; PROGRAM_UNIT];
    let mut readback = [0u8; PROGRAM_UNIT];
    let mut written = 0usize;

    while written < data.len() {
        watchdog.refresh();

        let remaining = data.len() - written;
        let chunk = remaining.min(PROGRAM_UNIT);
        unit.fill(0xFF);
        unit[..chunk].copy_from_slice(&data[written..written + chunk]);

        let unit_offset = offset + written as u32;
        device.program(bank, unit_offset, &unit)?;
        device.read(bank, unit_offset, &mut readback)?;
        if readback != unit {
            return Err(FlashError::VerifyMismatch);
        }

        written += chunk;
    }

    Ok(())
}

/// Computes the SHA-256 digest of the first `size` bytes of `bank`.
pub(crate) fn digest_staged<D: FlashDevice, W: Watchdog>(
    device: &D,
    watchdog: &mut W,
    bank: FlashBank,
    size: u32,
) -> Result<[u8; 32], FlashError> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; DIGEST_CHUNK];
    let mut offset = 0u32;

    while offset < size {
        watchdog.refresh();
        let chunk = ((size - offset) as usize).min(DIGEST_CHUNK);
        device.read(bank, offset, &mut buf[..chunk])?;
        hasher.update(&buf[..chunk]);
        offset += chunk as u32;
    }

    Ok(hasher.finalize().into())
}
