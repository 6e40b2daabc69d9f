/*++

Licensed under the Apache-2.0 license.

File Name:

    crypto.rs

Abstract:

    File contains the parameter CRC, the OTP key material, and the
    encrypted-bank transport over the serial EEPROM.

--*/

use crate::seeprom::{Seeprom, SeepromError};
use boot1_hil::{cbc_decrypt, cbc_encrypt, AesCore, EepromPins, AES_BLOCK_SIZE};
use std::io::Read;
use std::path::Path;

/// One encrypted SEEPROM bank: a single AES block, eight words.
pub const BANK_SIZE: usize = AES_BLOCK_SIZE;

const WORDS_PER_BANK: usize = BANK_SIZE / 2;

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xedb8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// CRC32 over `bytes`, reflected 0xedb88320 polynomial, as the boot ROM
/// computes it over parameter records.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = 0xffff_ffffu32;
    for &b in bytes {
        c = CRC32_TABLE[((c ^ u32::from(b)) & 0xff) as usize] ^ (c >> 8);
    }
    c ^ 0xffff_ffff
}

/// Key material normally read out of the OTP fuse banks.
pub struct OtpKeys {
    /// Decrypts the SEEPROM's encrypted banks.
    pub seeprom_key: [u8; AES_BLOCK_SIZE],
    /// Decrypts encrypted ancast image bodies.
    pub ancast_key: [u8; AES_BLOCK_SIZE],
}

impl OtpKeys {
    /// Fixed keys for running against the device models.
    pub fn development() -> Self {
        OtpKeys {
            seeprom_key: *b"DEV-SEEPROM-KEY!",
            ancast_key: *b"DEV-ANCAST-KEY!!",
        }
    }

    /// Load keys from a 32-byte dump: the SEEPROM bank key followed by the
    /// ancast body key.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(path)?;
        let mut seeprom_key = [0u8; AES_BLOCK_SIZE];
        let mut ancast_key = [0u8; AES_BLOCK_SIZE];
        file.read_exact(&mut seeprom_key)?;
        file.read_exact(&mut ancast_key)?;
        Ok(OtpKeys {
            seeprom_key,
            ancast_key,
        })
    }
}

/// Read `out.len() / BANK_SIZE` consecutive banks starting at bank index
/// `bank`, decrypting each one CBC with a zero IV.
pub fn read_encrypted_banks(
    pins: &mut dyn EepromPins,
    aes: &mut dyn AesCore,
    key: &[u8; AES_BLOCK_SIZE],
    bank: u8,
    out: &mut [u8],
) {
    assert_eq!(out.len() % BANK_SIZE, 0);

    aes.reset();
    aes.set_key(key);
    aes.clear_iv();

    let mut drv = Seeprom::new(pins);
    for (i, chunk) in out.chunks_exact_mut(BANK_SIZE).enumerate() {
        let mut words = [0u16; WORDS_PER_BANK];
        let offset = ((bank as usize + i) * WORDS_PER_BANK) as u8;
        drv.read(offset, &mut words);
        for (j, word) in words.iter().enumerate() {
            chunk[j * 2..j * 2 + 2].copy_from_slice(&word.to_le_bytes());
        }
        cbc_decrypt(aes, chunk);
    }
}

/// Encrypt and store consecutive banks starting at bank index `bank`. Each
/// bank chains from a fresh zero IV, and every word is write-verified by the
/// driver.
pub fn write_encrypted_banks(
    pins: &mut dyn EepromPins,
    aes: &mut dyn AesCore,
    key: &[u8; AES_BLOCK_SIZE],
    bank: u8,
    data: &[u8],
) -> Result<(), SeepromError> {
    assert_eq!(data.len() % BANK_SIZE, 0);

    aes.reset();
    aes.set_key(key);
    aes.clear_iv();

    let mut drv = Seeprom::new(pins);
    for (i, chunk) in data.chunks_exact(BANK_SIZE).enumerate() {
        let mut encrypted = [0u8; BANK_SIZE];
        encrypted.copy_from_slice(chunk);
        cbc_encrypt(aes, &mut encrypted);

        let mut words = [0u16; WORDS_PER_BANK];
        for (j, word) in words.iter_mut().enumerate() {
            *word = u16::from_le_bytes([encrypted[j * 2], encrypted[j * 2 + 1]]);
        }
        let offset = ((bank as usize + i) * WORDS_PER_BANK) as u8;
        drv.write(offset, &words)?;
    }
    Ok(())
}
