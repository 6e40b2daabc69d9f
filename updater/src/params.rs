/*++

Licensed under the Apache-2.0 license.

File Name:

    params.rs

Abstract:

    File contains the redundant boot1 parameter store.

--*/

use crate::crypto::{crc32, read_encrypted_banks, write_encrypted_banks};
use crate::seeprom::SeepromError;
use boot1_hil::{AesCore, EepromPins, AES_BLOCK_SIZE};
use core::mem::{offset_of, size_of};
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// SEEPROM bank index backing each parameter slot.
pub const SLOT_BANKS: [u8; 2] = [0x1d, 0x1e];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("no parameter slot carries a valid record")]
    NoValidSlot,
    #[error(transparent)]
    Seeprom(#[from] SeepromError),
}

/// One parameter record, exactly one encrypted bank.
///
/// `nand_block` packs the erase-block number in bits 0..12 and the bank
/// select in bit 12 (set for the primary bank, clear for the legacy
/// compatibility bank). The checksum covers everything before itself.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Boot1Params {
    pub nand_block: U16<LittleEndian>,
    pub reserved: [u8; 6],
    pub version: U32<LittleEndian>,
    pub checksum: U32<LittleEndian>,
}

impl Boot1Params {
    pub fn new(nand_block: u16, version: u32) -> Self {
        let mut record = Boot1Params {
            nand_block: nand_block.into(),
            reserved: [0; 6],
            version: version.into(),
            checksum: 0.into(),
        };
        record.checksum = record.compute_checksum().into();
        record
    }

    /// Erase-block number within the selected bank.
    pub fn block(&self) -> usize {
        usize::from(self.nand_block.get() & 0x0fff)
    }

    /// True when the record points into the primary bank. A clear bit means
    /// the compatibility bank, which this agent refuses to touch.
    pub fn is_primary_bank(&self) -> bool {
        self.nand_block.get() & 0x1000 != 0
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32(&self.as_bytes()[..offset_of!(Boot1Params, checksum)])
    }

    pub fn is_valid(&self) -> bool {
        self.checksum.get() == self.compute_checksum()
    }
}

/// Both parameter slots and the operations the install protocol performs on
/// them. Every mutation is written through immediately and read-back
/// verified by the driver; nothing here is durable until the write call
/// returns.
pub struct ParamStore {
    records: [Boot1Params; 2],
}

impl ParamStore {
    pub fn load(
        pins: &mut dyn EepromPins,
        aes: &mut dyn AesCore,
        key: &[u8; AES_BLOCK_SIZE],
    ) -> Self {
        let mut records = [Boot1Params::new(0, 0); 2];
        for (slot, record) in records.iter_mut().enumerate() {
            let mut bank = [0u8; size_of::<Boot1Params>()];
            read_encrypted_banks(pins, aes, key, SLOT_BANKS[slot], &mut bank);
            *record = Boot1Params::read_from_bytes(&bank).expect("record is exactly one bank");
        }
        ParamStore { records }
    }

    pub fn from_records(records: [Boot1Params; 2]) -> Self {
        ParamStore { records }
    }

    pub fn record(&self, slot: usize) -> &Boot1Params {
        &self.records[slot]
    }

    /// The slot the boot ROM would select: the valid record with the
    /// highest version. Ties go to slot 0, like the ROM.
    pub fn current_slot(&self) -> Result<usize, ParamError> {
        let mut best: Option<usize> = None;
        for (slot, record) in self.records.iter().enumerate() {
            if !record.is_valid() {
                log::warn!("params: slot {slot} checksum mismatch, ignoring");
                continue;
            }
            if best.map_or(true, |b| record.version.get() > self.records[b].version.get()) {
                best = Some(slot);
            }
        }
        best.ok_or(ParamError::NoValidSlot)
    }

    fn persist(
        &self,
        slot: usize,
        pins: &mut dyn EepromPins,
        aes: &mut dyn AesCore,
        key: &[u8; AES_BLOCK_SIZE],
    ) -> Result<(), ParamError> {
        write_encrypted_banks(pins, aes, key, SLOT_BANKS[slot], self.records[slot].as_bytes())?;
        Ok(())
    }

    /// Zero the slot's checksum so the ROM can never select it, and make
    /// that durable before anything else happens to the slot's block.
    pub fn invalidate(
        &mut self,
        slot: usize,
        pins: &mut dyn EepromPins,
        aes: &mut dyn AesCore,
        key: &[u8; AES_BLOCK_SIZE],
    ) -> Result<(), ParamError> {
        self.records[slot].checksum = 0.into();
        self.persist(slot, pins, aes, key)
    }

    /// Stamp `slot` with `version` and a fresh checksum. Once this returns,
    /// the ROM prefers the slot if its version is the highest.
    pub fn commit(
        &mut self,
        slot: usize,
        version: u32,
        pins: &mut dyn EepromPins,
        aes: &mut dyn AesCore,
        key: &[u8; AES_BLOCK_SIZE],
    ) -> Result<(), ParamError> {
        self.records[slot].version = version.into();
        self.records[slot].checksum = self.records[slot].compute_checksum().into();
        self.persist(slot, pins, aes, key)
    }

    /// Write both records out, for provisioning a fresh part.
    pub fn store_all(
        &self,
        pins: &mut dyn EepromPins,
        aes: &mut dyn AesCore,
        key: &[u8; AES_BLOCK_SIZE],
    ) -> Result<(), ParamError> {
        for slot in 0..self.records.len() {
            self.persist(slot, pins, aes, key)?;
        }
        Ok(())
    }
}
