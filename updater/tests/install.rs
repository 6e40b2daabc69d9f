// Licensed under the Apache-2.0 license

//! End-to-end installation runs against the emulated devices.

use ancast::{InfoBlock, ANCAST_MAGIC, BODY_IV, EXPECTED_SIGNATURE_OFFSET};
use boot1_hil::{cbc_encrypt, AesCore, Decision, NandError, NandFlash};
use boot1_updater::crypto::OtpKeys;
use boot1_updater::params::{Boot1Params, ParamError, ParamStore};
use boot1_updater::{run, InstallError, InstallOptions, UpdaterEnv};
use emulator_periph::{AesModel, ButtonScript, NandArgs, NandModel, SeepromArgs, SeepromModel};
use nand_ecc::{BOOT_BLOCK_SIZE, PAGES_PER_BLOCK, PAGE_SIZE, PAGE_SPARE_SIZE};
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tempfile::NamedTempFile;
use zerocopy::IntoBytes;

const BODY_OFFSET: usize = 0x200;

/// A complete, installable boot1 image: type-2 container, encrypted IOP
/// body, digest over the plaintext.
fn build_boot1_image(version: u32) -> Vec<u8> {
    let keys = OtpKeys::development();
    let body: Vec<u8> = (0..BOOT_BLOCK_SIZE - BODY_OFFSET)
        .map(|i| (i * 31 + 7) as u8)
        .collect();

    let mut stored = body.clone();
    let mut aes = AesModel::new();
    aes.set_key(&keys.ancast_key);
    aes.set_iv(&BODY_IV);
    cbc_encrypt(&mut aes, &mut stored);

    let mut image = vec![0u8; BOOT_BLOCK_SIZE];
    image[0..4].copy_from_slice(&ANCAST_MAGIC.to_le_bytes());
    image[8..12].copy_from_slice(&EXPECTED_SIGNATURE_OFFSET.to_le_bytes());
    image[0x20..0x24].copy_from_slice(&2u32.to_le_bytes());
    image[0x24..0x34].fill(0x5a);

    let info = InfoBlock {
        nullpad0: 0.into(),
        nullpad1: 0,
        nullpad2: 0,
        device: 0x21.into(),
        image_type: 0x21.into(),
        body_size: (body.len() as u32).into(),
        body_hash: Sha1::digest(&body).into(),
        version: version.into(),
        nullpad3: [0; 0x38],
    };
    image[0x1a0..BODY_OFFSET].copy_from_slice(info.as_bytes());
    image[BODY_OFFSET..].copy_from_slice(&stored);
    image
}

fn image_file(image: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(image).unwrap();
    file.flush().unwrap();
    file
}

struct Rig {
    seeprom: Rc<RefCell<SeepromModel>>,
    nand: Rc<RefCell<NandModel>>,
    env: UpdaterEnv,
}

fn rig(records: [Boot1Params; 2], decisions: &[Decision]) -> Rig {
    let keys = OtpKeys::development();
    let seeprom = Rc::new(RefCell::new(
        SeepromModel::new(SeepromArgs::default()).unwrap(),
    ));
    let nand = Rc::new(RefCell::new(
        NandModel::new(NandArgs {
            blocks: 4,
            file: None,
        })
        .unwrap(),
    ));
    let mut aes = AesModel::new();

    let mut pins = seeprom.clone();
    ParamStore::from_records(records)
        .store_all(&mut pins, &mut aes, &keys.seeprom_key)
        .unwrap();

    let env = UpdaterEnv {
        nand: Box::new(nand.clone()),
        aes: Box::new(aes),
        eeprom: Box::new(seeprom.clone()),
        input: Box::new(ButtonScript::new(decisions.iter().copied())),
        keys,
    };
    Rig { seeprom, nand, env }
}

/// Slot 1 boots (higher version); installs land in slot 0 at block 1.
fn default_records() -> [Boot1Params; 2] {
    [Boot1Params::new(0x1001, 5), Boot1Params::new(0x1002, 6)]
}

/// What a freshly powered-on agent would see in the SEEPROM.
fn reload_params(rig: &Rig) -> ParamStore {
    let mut pins = rig.seeprom.clone();
    let mut aes = AesModel::new();
    ParamStore::load(&mut pins, &mut aes, &OtpKeys::development().seeprom_key)
}

fn read_nand_block(rig: &Rig, block: usize) -> Vec<u8> {
    let mut out = vec![0u8; BOOT_BLOCK_SIZE];
    let mut spare = [0u8; PAGE_SPARE_SIZE];
    let mut nand = rig.nand.borrow_mut();
    for (i, page) in out.chunks_exact_mut(PAGE_SIZE).enumerate() {
        nand.read_page(block * PAGES_PER_BLOCK + i, page, &mut spare)
            .unwrap();
    }
    out
}

fn opts(file: &NamedTempFile, commit: bool, retire_previous: bool) -> InstallOptions {
    InstallOptions {
        image: file.path().to_path_buf(),
        commit,
        retire_previous,
    }
}

#[test]
fn flash_without_commit_keeps_boot_slot() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Confirm]);

    run(&mut rig.env, &opts(&file, false, false)).unwrap();

    // The block holds the image bit for bit, but the ROM still boots the
    // old slot: the new one was left invalidated.
    assert_eq!(read_nand_block(&rig, 1), image);
    let store = reload_params(&rig);
    assert_eq!(store.current_slot(), Ok(1));
    assert!(!store.record(0).is_valid());
}

#[test]
fn commit_activates_new_slot() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Confirm]);

    run(&mut rig.env, &opts(&file, true, false)).unwrap();

    let store = reload_params(&rig);
    assert_eq!(store.current_slot(), Ok(0));
    assert_eq!(store.record(0).version.get(), 7);
    assert_eq!(store.record(0).block(), 1);
    // The old slot stays bootable as a fallback.
    assert!(store.record(1).is_valid());
    assert_eq!(store.record(1).version.get(), 6);
}

#[test]
fn retire_previous_invalidates_old_slot() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Confirm]);

    run(&mut rig.env, &opts(&file, true, true)).unwrap();

    let store = reload_params(&rig);
    assert_eq!(store.current_slot(), Ok(0));
    assert!(!store.record(1).is_valid());
}

#[test]
fn retire_without_commit_is_rejected_up_front() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[]);

    let err = run(&mut rig.env, &opts(&file, false, true)).unwrap_err();
    assert!(matches!(err, InstallError::RetireWithoutCommit));

    let store = reload_params(&rig);
    assert!(store.record(0).is_valid());
    assert!(store.record(1).is_valid());
}

#[test]
fn cancel_leaves_everything_untouched() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Cancel]);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(err, InstallError::Cancelled));

    let store = reload_params(&rig);
    assert!(store.record(0).is_valid());
    assert!(store.record(1).is_valid());
    assert_eq!(store.current_slot(), Ok(1));
    assert!(read_nand_block(&rig, 1).iter().all(|&b| b == 0xff));
}

#[test]
fn wrong_size_image_is_rejected() {
    let image = build_boot1_image(7);
    let file = image_file(&image[..BOOT_BLOCK_SIZE / 2]);
    let mut rig = rig(default_records(), &[]);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(
        err,
        InstallError::BadImageSize(n) if n == BOOT_BLOCK_SIZE / 2
    ));
}

#[test]
fn corrupt_body_is_rejected_before_any_mutation() {
    let mut image = build_boot1_image(7);
    let last = image.len() - 1;
    image[last] ^= 0x40;
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[]);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(err, InstallError::Format(_)));

    let store = reload_params(&rig);
    assert!(store.record(0).is_valid());
    assert!(store.record(1).is_valid());
}

#[test]
fn compatibility_bank_slot_is_refused() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    // The install target (slot 0) sits in the compatibility bank. No
    // decision is scripted: the refusal must come before the prompt.
    let records = [Boot1Params::new(0x0001, 5), Boot1Params::new(0x1002, 6)];
    let mut rig = rig(records, &[]);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(err, InstallError::CompatibilityBank(0)));
}

#[test]
fn both_slots_invalid_is_fatal() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut a = Boot1Params::new(0x1001, 1);
    let mut b = Boot1Params::new(0x1002, 2);
    a.checksum = (a.checksum.get() ^ 1).into();
    b.checksum = (b.checksum.get() ^ 1).into();
    let mut rig = rig([a, b], &[]);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(err, InstallError::Params(ParamError::NoValidSlot)));
}

#[test]
fn page_write_failure_keeps_old_slot_bootable() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Confirm]);
    let failing_page = PAGES_PER_BLOCK + 5; // inside block 1
    rig.nand.borrow_mut().fail_page_write(failing_page);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(
        err,
        InstallError::Nand(NandError::WriteFailed(p)) if p == failing_page
    ));

    // The interrupted slot was already invalidated; the boot slot is
    // untouched and still selected.
    let store = reload_params(&rig);
    assert_eq!(store.current_slot(), Ok(1));
    assert!(!store.record(0).is_valid());
}

#[test]
fn erase_failure_after_invalidation_keeps_old_slot_bootable() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Confirm]);
    rig.nand.borrow_mut().mark_bad_block(1);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(
        err,
        InstallError::Nand(NandError::EraseFailed(1))
    ));

    let store = reload_params(&rig);
    assert_eq!(store.current_slot(), Ok(1));
    assert!(!store.record(0).is_valid());
}

#[test]
fn seeprom_write_failure_aborts_before_flashing() {
    let image = build_boot1_image(7);
    let file = image_file(&image);
    let mut rig = rig(default_records(), &[Decision::Confirm]);
    rig.seeprom.borrow_mut().set_write_protect(true);

    let err = run(&mut rig.env, &opts(&file, true, false)).unwrap_err();
    assert!(matches!(
        err,
        InstallError::Params(ParamError::Seeprom(_))
    ));

    // Nothing reached the NAND.
    assert!(read_nand_block(&rig, 1).iter().all(|&b| b == 0xff));
}
