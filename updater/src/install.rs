/*++

Licensed under the Apache-2.0 license.

File Name:

    install.rs

Abstract:

    File contains the boot1 installation protocol.

--*/

use crate::crypto::OtpKeys;
use crate::params::{ParamError, ParamStore};
use ancast::{load_for, AncastError, AncastImage, Target};
use boot1_hil::{AesCore, Decision, EepromPins, NandError, NandFlash, UserInput};
use nand_ecc::{make_page_spare, BOOT_BLOCK_SIZE, PAGES_PER_BLOCK, PAGE_SIZE, PAGE_SPARE_SIZE};
use std::path::PathBuf;
use thiserror::Error;

/// Every device the protocol touches, behind its interface trait.
pub struct UpdaterEnv {
    pub nand: Box<dyn NandFlash>,
    pub aes: Box<dyn AesCore>,
    pub eeprom: Box<dyn EepromPins>,
    pub input: Box<dyn UserInput>,
    pub keys: OtpKeys,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("image is {0} bytes, boot1 occupies exactly {BOOT_BLOCK_SIZE}")]
    BadImageSize(usize),
    #[error(transparent)]
    Format(#[from] AncastError),
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Nand(#[from] NandError),
    #[error("slot {0} points into the compatibility bank; refusing to touch it")]
    CompatibilityBank(usize),
    #[error("installation cancelled")]
    Cancelled,
    #[error("read-back differs from the candidate image")]
    ReadBackMismatch,
    #[error("retiring the previous slot requires committing the new one")]
    RetireWithoutCommit,
}

pub struct InstallOptions {
    pub image: PathBuf,
    /// Repoint the boot ROM at the new slot once it verifies.
    pub commit: bool,
    /// Invalidate the previously booting slot after the commit.
    pub retire_previous: bool,
}

/// Install a candidate boot1 image into the slot the ROM is not booting
/// from.
///
/// The ordering is what makes this safe to interrupt anywhere: the target
/// slot is invalidated (durably) before its block is touched, the flashed
/// block is read back and compared bit for bit before anything is
/// committed, and the commit and the retirement of the old slot sit behind
/// separate explicit gates. Neither gate defaults on.
pub fn run(env: &mut UpdaterEnv, opts: &InstallOptions) -> Result<(), InstallError> {
    if opts.retire_previous && !opts.commit {
        return Err(InstallError::RetireWithoutCommit);
    }

    let image = std::fs::read(&opts.image)?;
    if image.len() != BOOT_BLOCK_SIZE {
        return Err(InstallError::BadImageSize(image.len()));
    }

    let candidate = AncastImage::parse(&image)?;
    candidate.verify_structure()?;
    // Full content check on the plaintext body; the image stays on disk in
    // its stored (possibly encrypted) form and is flashed as-is.
    let loaded = load_for(&image, Target::Iop, env.aes.as_mut(), &env.keys.ancast_key)?;
    log::info!(
        "candidate boot1 version {} (type {} signature, {} byte body, load address 0x{:08x})",
        loaded.version,
        candidate.signature().type_tag(),
        loaded.body.len(),
        loaded.load_address
    );

    let mut store = ParamStore::load(env.eeprom.as_mut(), env.aes.as_mut(), &env.keys.seeprom_key);
    let boot_slot = store.current_slot()?;
    let install_slot = 1 - boot_slot;

    for slot in [boot_slot, install_slot] {
        if !store.record(slot).is_primary_bank() {
            return Err(InstallError::CompatibilityBank(slot));
        }
    }

    let boot_version = store.record(boot_slot).version.get();
    let block = store.record(install_slot).block();
    log::info!(
        "boot slot {boot_slot} (version {boot_version}); installing into slot {install_slot} at block 0x{block:x}"
    );
    if !opts.commit {
        log::info!("no commit requested: the slot will be flashed and verified, then left inactive");
    } else if loaded.version <= boot_version && !opts.retire_previous {
        log::warn!(
            "version {} does not exceed the boot slot's {boot_version}; the ROM will keep booting slot {boot_slot}",
            loaded.version
        );
    }

    if env.input.wait_decision() != Decision::Confirm {
        return Err(InstallError::Cancelled);
    }

    // The target slot must be unbootable before its block changes. A crash
    // anywhere past this point leaves the ROM on the untouched slot.
    store.invalidate(
        install_slot,
        env.eeprom.as_mut(),
        env.aes.as_mut(),
        &env.keys.seeprom_key,
    )?;
    log::info!("slot {install_slot} invalidated");

    flash_block(env.nand.as_mut(), block, &image)?;
    log::info!("flashed {PAGES_PER_BLOCK} pages to block 0x{block:x}");

    let readback = read_block(env.nand.as_mut(), block)?;
    let reread = AncastImage::parse(&readback)?;
    reread.verify_structure()?;
    if readback != image {
        return Err(InstallError::ReadBackMismatch);
    }
    log::info!("read-back verified against the candidate");

    if !opts.commit {
        log::info!("leaving slot {install_slot} uncommitted; rerun with the commit gate to activate it");
        return Ok(());
    }

    store.commit(
        install_slot,
        loaded.version,
        env.eeprom.as_mut(),
        env.aes.as_mut(),
        &env.keys.seeprom_key,
    )?;
    log::warn!(
        "slot {install_slot} committed at version {}; the ROM selects the highest valid version",
        loaded.version
    );

    if opts.retire_previous {
        store.invalidate(
            boot_slot,
            env.eeprom.as_mut(),
            env.aes.as_mut(),
            &env.keys.seeprom_key,
        )?;
        log::warn!("slot {boot_slot} retired; version {boot_version} is no longer bootable");
    }

    Ok(())
}

/// Erase the block and program every page, data then ECC spare.
fn flash_block(nand: &mut dyn NandFlash, block: usize, image: &[u8]) -> Result<(), InstallError> {
    nand.erase_block(block)?;
    let first = block * PAGES_PER_BLOCK;
    for (i, page) in image.chunks_exact(PAGE_SIZE).enumerate() {
        nand.write_page(first + i, page)?;
        nand.write_page_spare(first + i, &make_page_spare(page))?;
    }
    Ok(())
}

/// Read the block back through the ECC correction path.
fn read_block(nand: &mut dyn NandFlash, block: usize) -> Result<Vec<u8>, InstallError> {
    let mut out = vec![0u8; BOOT_BLOCK_SIZE];
    let mut spare = [0u8; PAGE_SPARE_SIZE];
    let first = block * PAGES_PER_BLOCK;
    for (i, page) in out.chunks_exact_mut(PAGE_SIZE).enumerate() {
        nand.read_page(first + i, page, &mut spare)?;
        nand.correct_page(first + i, page, &spare)?;
    }
    Ok(out)
}
