// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Dual-bank flash device abstractions for the OTA platform layer
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here + scenario coverage in tests/ota_pal_host
//!
//! PUBLIC API:
//!   - FlashBank: One of the two interchangeable flash banks
//!   - FlashDevice: Bank-granular erase/program/read plus boot-bank control
//!   - Watchdog: Liveness refresh hook serviced during long flash loops
//!   - MemFlashDevice / NullWatchdog: Simulation types for host tests
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// One of exactly two equal-size, independently erasable flash banks.
///
/// Exactly one bank is bootable ("active") at a time; the other is the
/// staging target for a candidate image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashBank {
    A,
    B,
}

impl FlashBank {
    /// The complement bank.
    pub fn other(self) -> Self {
        match self {
            FlashBank::A => FlashBank::B,
            FlashBank::B => FlashBank::A,
        }
    }
}

impl fmt::Display for FlashBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashBank::A => write!(f, "bank A"),
            FlashBank::B => write!(f, "bank B"),
        }
    }
}

/// Flash device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Erase or program operation failed at the hardware level.
    HardwareFault,
    /// Offset/length outside the bank.
    OutOfRange,
    /// Read-back comparison after programming diverged from the source.
    VerifyMismatch,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::HardwareFault => write!(f, "flash hardware fault"),
            FlashError::OutOfRange => write!(f, "flash access out of range"),
            FlashError::VerifyMismatch => write!(f, "flash read-back mismatch"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FlashError {}

/// Liveness refresh hook.
///
/// Flash erase and program loops block for tens to hundreds of milliseconds;
/// implementations are expected to pet an independent watchdog facility so
/// a long flash operation is never misinterpreted as a hang.
pub trait Watchdog {
    fn refresh(&mut self);
}

/// No-op watchdog for hosts without a liveness facility.
pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn refresh(&mut self) {}
}

/// Abstract dual-bank flash device.
///
/// Bank identity is stable across reboots; which bank is active is decided
/// by the boot configuration committed with [`FlashDevice::set_boot_bank`]
/// and only takes effect at the next [`FlashDevice::reset`].
pub trait FlashDevice {
    /// Size of one bank in bytes. Both banks are the same size.
    fn bank_size(&self) -> u32;

    /// The bank the device booted from. Cannot change without a reset.
    fn boot_bank(&self) -> FlashBank;

    /// Durably updates the boot configuration so `bank` is active after the
    /// next reset. Selecting the already-configured bank is a no-op.
    fn set_boot_bank(&mut self, bank: FlashBank) -> Result<(), FlashError>;

    /// Forces a system reset.
    ///
    /// On real hardware this call diverges: control resumes in boot-time
    /// recovery on the next boot, and nothing after this call can be relied
    /// upon to execute. Simulated devices apply the pending boot-bank
    /// selection and return so host tests can model the reboot.
    fn reset(&mut self) -> Result<(), FlashError>;

    /// Erases an entire bank. The caller must never pass the active bank.
    fn erase_bank(&mut self, bank: FlashBank) -> Result<(), FlashError>;

    /// Programs `data` at `offset` within `bank`.
    fn program(&mut self, bank: FlashBank, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Reads `buf.len()` bytes from `offset` within `bank`.
    fn read(&self, bank: FlashBank, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

/// In-memory dual-bank flash device for host testing.
///
/// Erased bytes read as 0xFF. Reset applies any pending boot-bank selection,
/// mirroring the option-byte launch on the real part.
pub struct MemFlashDevice {
    bank_size: u32,
    banks: [Vec<u8>; 2],
    boot_bank: FlashBank,
    pending_boot_bank: Option<FlashBank>,
    reset_count: u32,
    fail_erase: bool,
    corrupt_programs: bool,
}

impl MemFlashDevice {
    /// Creates a device with both banks erased and bank A active.
    pub fn new(bank_size: u32) -> Self {
        Self {
            bank_size,
            banks: [vec![0xFF; bank_size as usize], vec![0xFF; bank_size as usize]],
            boot_bank: FlashBank::A,
            pending_boot_bank: None,
            reset_count: 0,
            fail_erase: false,
            corrupt_programs: false,
        }
    }

    fn bank_index(bank: FlashBank) -> usize {
        match bank {
            FlashBank::A => 0,
            FlashBank::B => 1,
        }
    }

    /// Raw access to one bank's contents (for tampering fixtures).
    pub fn bank_mut(&mut self, bank: FlashBank) -> &mut [u8] {
        &mut self.banks[Self::bank_index(bank)]
    }

    /// Number of resets the device has observed.
    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    /// The boot-bank selection that will apply at the next reset, if any.
    pub fn pending_boot_bank(&self) -> Option<FlashBank> {
        self.pending_boot_bank
    }

    /// Makes subsequent erase operations report a hardware fault.
    pub fn set_fail_erase(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    /// Makes subsequent program operations silently corrupt the first byte
    /// written, so read-back verification trips.
    pub fn set_corrupt_programs(&mut self, corrupt: bool) {
        self.corrupt_programs = corrupt;
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), FlashError> {
        let end = (offset as u64).saturating_add(len as u64);
        if end > self.bank_size as u64 {
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }
}

impl FlashDevice for MemFlashDevice {
    fn bank_size(&self) -> u32 {
        self.bank_size
    }

    fn boot_bank(&self) -> FlashBank {
        self.boot_bank
    }

    fn set_boot_bank(&mut self, bank: FlashBank) -> Result<(), FlashError> {
        if bank == self.boot_bank {
            self.pending_boot_bank = None;
        } else {
            self.pending_boot_bank = Some(bank);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), FlashError> {
        if let Some(bank) = self.pending_boot_bank.take() {
            self.boot_bank = bank;
        }
        self.reset_count += 1;
        Ok(())
    }

    fn erase_bank(&mut self, bank: FlashBank) -> Result<(), FlashError> {
        if self.fail_erase {
            return Err(FlashError::HardwareFault);
        }
        self.banks[Self::bank_index(bank)].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, bank: FlashBank, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_range(offset, data.len())?;
        let start = offset as usize;
        let slice = &mut self.banks[Self::bank_index(bank)][start..start + data.len()];
        slice.copy_from_slice(data);
        if self.corrupt_programs && !slice.is_empty() {
            slice[0] ^= 0x01;
        }
        Ok(())
    }

    fn read(&self, bank: FlashBank, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.banks[Self::bank_index(bank)][start..start + buf.len()]);
        Ok(())
    }
}
