// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: End-to-end OTA PAL scenarios across simulated reboots
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Stable
//! TEST_COVERAGE: This file
//!
//! A "reboot" here is tearing the PAL down with `into_parts` and rebuilding
//! it around the same device and context file, then running `early_init`.
//! PAL-driven resets (activation, rollback) already reset the simulated
//! device before returning; an unexpected reset (watchdog) is modeled by
//! resetting the device by hand between teardown and rebuild.
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

use flash_hal::{FlashBank, FlashDevice, MemFlashDevice, NullWatchdog};
use otapal::context::ContextFile;
use otapal::{
    FsContextFile, ImageMeta, ImageState, MemContextFile, MemKeyProvider, OtaPal, PalConfig,
    PalError, PalImageState, PalState,
};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

const BANK_SIZE: u32 = 8192;
const IMAGE_NAME: &str = "app-firmware";
const KEY_LABEL: &str = "release-signer";

type Pal<F> = OtaPal<MemFlashDevice, NullWatchdog, F, MemKeyProvider>;

fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[42u8; 32]).expect("scalar in range")
}

fn key_provider() -> MemKeyProvider {
    let mut keys = MemKeyProvider::new();
    keys.insert(KEY_LABEL, *signing_key().verifying_key());
    keys
}

fn signed_meta(image: &[u8]) -> ImageMeta {
    let digest: [u8; 32] = Sha256::digest(image).into();
    let signature: Signature = signing_key().sign_prehash(&digest).expect("sign");
    ImageMeta {
        file_identity: IMAGE_NAME.to_string(),
        declared_size: image.len() as u32,
        certificate_reference: KEY_LABEL.to_string(),
        signature: signature.to_der().as_bytes().to_vec(),
    }
}

fn boot<F: ContextFile>(device: MemFlashDevice, file: F) -> Pal<F> {
    let mut pal = OtaPal::new(device, NullWatchdog, file, key_provider(), PalConfig::new(IMAGE_NAME));
    pal.early_init().expect("early init");
    pal
}

/// Rebuilds the PAL after a PAL-driven reset (the device already rebooted).
fn reboot<F: ContextFile>(pal: Pal<F>) -> Pal<F> {
    let (device, _, file, _) = pal.into_parts();
    boot(device, file)
}

/// Models an unexpected reset (watchdog) before rebuilding the PAL.
fn watchdog_reset<F: ContextFile>(pal: Pal<F>) -> Pal<F> {
    let (mut device, _, file, _) = pal.into_parts();
    device.reset().expect("device reset");
    boot(device, file)
}

/// Stages `image` through create/write/close, leaving the PAL in
/// Pending Activation.
fn stage<F: ContextFile>(pal: &mut Pal<F>, image: &[u8]) {
    pal.create_file(&signed_meta(image)).expect("create");
    for (i, block) in image.chunks(256).enumerate() {
        let written = pal.write_block((i * 256) as u32, block).expect("write");
        assert_eq!(written, block.len());
    }
    pal.close_file().expect("close");
    assert_eq!(pal.state(), PalState::PendingActivation);
}

fn bank_contents(pal: Pal<MemContextFile>, bank: FlashBank, len: usize) -> Vec<u8> {
    let (mut device, ..) = pal.into_parts();
    device.bank_mut(bank)[..len].to_vec()
}

#[test]
fn test_full_cycle_stage_activate_self_test_commit() {
    let image = vec![0xA5u8; 1000];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    assert_eq!(pal.active_bank(), FlashBank::A);

    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    // First boot of the candidate.
    let mut pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::B);
    assert_eq!(pal.state(), PalState::NewImageBooted);
    assert_eq!(pal.get_image_state(), PalImageState::PendingCommit);

    pal.set_image_state(ImageState::Testing).expect("testing");
    pal.set_image_state(ImageState::Accepted).expect("accept");
    assert_eq!(pal.get_image_state(), PalImageState::Valid);

    // A later ordinary reboot starts a clean cycle from the new baseline.
    let pal = watchdog_reset(pal);
    assert_eq!(pal.active_bank(), FlashBank::B);
    assert_eq!(pal.state(), PalState::Ready);
    assert_eq!(bank_contents(pal, FlashBank::B, image.len()), image);
}

#[test]
fn test_commit_removes_recovery_context() {
    let image = vec![0x3Cu8; 512];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());

    // No context before activation.
    let (device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    pal = boot(device, file);

    stage(&mut pal, &image);
    let (device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    pal = boot(device, file);

    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    // Context present for the whole activation-to-commit window.
    let (device, _, file, _) = pal.into_parts();
    assert!(file.exists());
    let mut pal = boot(device, file);
    assert_eq!(pal.state(), PalState::NewImageBooted);

    pal.set_image_state(ImageState::Accepted).expect("accept");
    let (_, _, file, _) = pal.into_parts();
    assert!(!file.exists());
}

#[test]
fn test_explicit_rejection_rolls_back_and_erases() {
    let image = vec![0x77u8; 640];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    let mut pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::B);

    // The self-test decides against the candidate; the PAL persists the
    // failure and resets back into the original bank.
    pal.set_image_state(ImageState::Rejected).expect("reject");

    let pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::A);
    assert_eq!(pal.state(), PalState::Rejected);
    assert_eq!(pal.get_image_state(), PalImageState::Invalid);

    let (mut device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    assert!(device.bank_mut(FlashBank::B).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_watchdog_reset_during_self_test_rolls_back() {
    let image = vec![0x10u8; 320];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    let pal = reboot(pal);
    assert_eq!(pal.state(), PalState::NewImageBooted);

    // Candidate hangs and the watchdog fires; no accept ever arrives.
    // Recovery notices the repeated boot and schedules the reversion reset.
    let pal = watchdog_reset(pal);
    assert_eq!(pal.state(), PalState::NewImageWdtReset);

    // The reversion reset lands back in the original bank; recovery then
    // finishes the rollback.
    let pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::A);
    assert_eq!(pal.state(), PalState::Rejected);

    let (mut device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    assert!(device.bank_mut(FlashBank::B).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_reject_is_idempotent_after_self_test_failure() {
    let image = vec![0x88u8; 384];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    let mut pal = reboot(pal);
    assert_eq!(pal.state(), PalState::NewImageBooted);

    pal.set_image_state(ImageState::Rejected).expect("reject");
    assert_eq!(pal.state(), PalState::SelfTestFailed);

    // A retrying agent may repeat the rejection before the reversion reset
    // is observed; that must be a quiet success, not a second teardown.
    pal.set_image_state(ImageState::Rejected).expect("repeat reject");
    assert_eq!(pal.state(), PalState::SelfTestFailed);

    let mut pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::A);
    assert_eq!(pal.state(), PalState::Rejected);
    pal.set_image_state(ImageState::Rejected).expect("reject in terminal state");

    let (mut device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    assert!(device.bank_mut(FlashBank::B).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_abort_noop_once_reset_is_committed() {
    let image = vec![0x99u8; 288];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    // The reset is already committed; abort must not unwind it.
    pal.abort().expect("abort noop");
    assert_eq!(pal.state(), PalState::PendingSelfTest);

    let pal = reboot(pal);
    assert_eq!(pal.state(), PalState::NewImageBooted);

    // Same once the reversion reset has been scheduled.
    let mut pal = watchdog_reset(pal);
    assert_eq!(pal.state(), PalState::NewImageWdtReset);
    pal.abort().expect("abort noop");
    assert_eq!(pal.state(), PalState::NewImageWdtReset);

    let pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::A);
    assert_eq!(pal.state(), PalState::Rejected);
}

#[test]
fn test_reset_before_swap_takes_effect_recovers() {
    // Power is lost after the context is persisted but before the boot-bank
    // swap is committed: the next boot still runs the original bank while
    // the context claims a self-test is pending.
    let image = vec![0x66u8; 256];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    stage(&mut pal, &image);

    let (device, _, mut file, _) = pal.into_parts();
    file.write(&[1, 4, 2]).expect("context {PendingSelfTest, bank B}");

    let pal = boot(device, file);
    assert_eq!(pal.active_bank(), FlashBank::A);
    assert_eq!(pal.state(), PalState::Rejected);

    let (mut device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    assert!(device.bank_mut(FlashBank::B).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_digest_mismatch_rejected_at_close() {
    let image = vec![0x5Au8; 400];
    let other = vec![0xA5u8; 400];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());

    // Signature belongs to a different payload than the one staged.
    pal.create_file(&signed_meta(&other)).expect("create");
    pal.write_block(0, &image).expect("write");
    let err = pal.close_file().expect_err("digest mismatch");
    assert!(matches!(err, PalError::Verification(_)));
    assert_eq!(pal.state(), PalState::Rejected);

    // Nothing survived the rejection.
    let (mut device, _, file, _) = pal.into_parts();
    assert!(!file.exists());
    assert!(device.bank_mut(FlashBank::B).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_readback_mismatch_surfaces_during_write() {
    let image = vec![0x42u8; 128];
    let mut device = MemFlashDevice::new(BANK_SIZE);
    device.set_corrupt_programs(true);
    let mut pal = boot(device, MemContextFile::new());

    pal.create_file(&signed_meta(&image)).expect("create");
    let err = pal.write_block(0, &image).expect_err("read-back mismatch");
    assert!(matches!(err, PalError::Flash(_)));
    assert_eq!(pal.state(), PalState::FileOpen);

    // The agent gives up; abort returns the PAL to Ready.
    pal.abort().expect("abort");
    assert_eq!(pal.state(), PalState::Ready);
}

#[test]
fn test_abort_after_activation_is_deferred_to_recovery() {
    let image = vec![0x24u8; 192];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());
    stage(&mut pal, &image);
    pal.activate_image().expect("activate");

    // Once the candidate is live, teardown is owned by the reboot-driven
    // accept/reject paths; abort must not touch the banks.
    let mut pal = reboot(pal);
    assert_eq!(pal.state(), PalState::NewImageBooted);
    pal.abort().expect("abort noop");
    assert_eq!(pal.state(), PalState::NewImageBooted);
    assert_eq!(pal.get_image_state(), PalImageState::PendingCommit);
}

#[test]
fn test_second_update_cycle_swaps_back() {
    let first = vec![0x01u8; 500];
    let second = vec![0x02u8; 700];
    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), MemContextFile::new());

    stage(&mut pal, &first);
    pal.activate_image().expect("activate");
    let mut pal = reboot(pal);
    pal.set_image_state(ImageState::Accepted).expect("accept");
    assert_eq!(pal.active_bank(), FlashBank::B);

    // The next cycle stages into bank A, the former baseline.
    stage(&mut pal, &second);
    pal.activate_image().expect("activate");
    let mut pal = reboot(pal);
    assert_eq!(pal.active_bank(), FlashBank::A);
    pal.set_image_state(ImageState::Accepted).expect("accept");

    assert_eq!(bank_contents(pal, FlashBank::A, second.len()), second);
}

#[test]
fn test_recovery_context_survives_process_teardown_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("image_state");
    let image = vec![0x9Du8; 448];

    let mut pal = boot(MemFlashDevice::new(BANK_SIZE), FsContextFile::new(&path));
    stage(&mut pal, &image);
    pal.activate_image().expect("activate");
    let (device, ..) = pal.into_parts();

    // A fresh file handle on the same path stands in for a cold start.
    let mut pal = boot(device, FsContextFile::new(&path));
    assert_eq!(pal.active_bank(), FlashBank::B);
    assert_eq!(pal.state(), PalState::NewImageBooted);

    pal.set_image_state(ImageState::Accepted).expect("accept");
    assert!(!path.exists());
}
