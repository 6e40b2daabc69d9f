// Licensed under the Apache-2.0 license

//! NAND page geometry and the Hamming-style ECC codec.
//!
//! The code layout is consumed by the boot ROM's correction hardware, so the
//! bit placement here is load-bearing: twelve parity-bit pairs are reduced
//! and packed into two little-endian 16-bit words per 512-byte subpage.

/// Bytes in the data region of one NAND page.
pub const PAGE_SIZE: usize = 2048;
/// Bytes in the spare (out-of-band) region of one NAND page.
pub const PAGE_SPARE_SIZE: usize = 64;
/// Pages per erase block.
pub const PAGES_PER_BLOCK: usize = 64;
/// Bytes of page data covered by one boot block.
pub const BOOT_BLOCK_SIZE: usize = PAGES_PER_BLOCK * PAGE_SIZE;

/// Bytes of data covered by one ECC code.
pub const ECC_SUBPAGE_SIZE: usize = 512;
/// Size of one packed ECC code.
pub const ECC_SIZE: usize = 4;
/// Offset of the first ECC code within the spare region.
pub const ECC_SPARE_OFFSET: usize = 0x30;
/// Good-page marker stored in the first spare byte.
pub const GOOD_PAGE_MARKER: u8 = 0xff;

fn parity(mut x: u8) -> u8 {
    let mut y = 0;
    while x != 0 {
        y ^= x & 1;
        x >>= 1;
    }
    y
}

/// Compute the 4-byte ECC code for one 512-byte subpage.
///
/// For each byte, the nine address bits of its index select which of a pair
/// of accumulators the byte is XORed into; three column-parity pairs are
/// then derived from the bit-sliced parity of the top-level pair. The twelve
/// "even" parity bits pack into one 16-bit word and the twelve "odd" bits
/// into another, emitted little-endian.
pub fn calc_ecc(data: &[u8; ECC_SUBPAGE_SIZE]) -> [u8; ECC_SIZE] {
    let mut a = [[0u8; 2]; 12];

    for (i, &x) in data.iter().enumerate() {
        for j in 0..9 {
            a[3 + j][(i >> j) & 1] ^= x;
        }
    }

    let x = a[3][0] ^ a[3][1];
    a[0][0] = x & 0x55;
    a[0][1] = x & 0xaa;
    a[1][0] = x & 0x33;
    a[1][1] = x & 0xcc;
    a[2][0] = x & 0x0f;
    a[2][1] = x & 0xf0;

    let mut a0 = 0u16;
    let mut a1 = 0u16;
    for (j, pair) in a.iter().enumerate() {
        a0 |= u16::from(parity(pair[0])) << j;
        a1 |= u16::from(parity(pair[1])) << j;
    }

    let mut ecc = [0u8; ECC_SIZE];
    ecc[..2].copy_from_slice(&a0.to_le_bytes());
    ecc[2..].copy_from_slice(&a1.to_le_bytes());
    ecc
}

/// Build the spare region for a page about to be written: good-page marker
/// in byte 0, one ECC code per 512-byte quarter starting at
/// [`ECC_SPARE_OFFSET`], everything else zero.
///
/// # Panics
///
/// Panics if `data` is not exactly one page.
pub fn make_page_spare(data: &[u8]) -> [u8; PAGE_SPARE_SIZE] {
    assert_eq!(data.len(), PAGE_SIZE);

    let mut spare = [0u8; PAGE_SPARE_SIZE];
    spare[0] = GOOD_PAGE_MARKER;

    for (i, subpage) in data.chunks_exact(ECC_SUBPAGE_SIZE).enumerate() {
        let code = calc_ecc(subpage.try_into().unwrap());
        let off = ECC_SPARE_OFFSET + i * ECC_SIZE;
        spare[off..off + ECC_SIZE].copy_from_slice(&code);
    }

    spare
}
