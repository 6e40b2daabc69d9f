/*++

Licensed under the Apache-2.0 license.

File Name:

    nand.rs

Abstract:

    File contains the emulated raw NAND array and its correction path.

--*/

use boot1_hil::{NandError, NandFlash};
use nand_ecc::{
    calc_ecc, ECC_SIZE, ECC_SPARE_OFFSET, ECC_SUBPAGE_SIZE, PAGES_PER_BLOCK, PAGE_SIZE,
    PAGE_SPARE_SIZE,
};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;

#[derive(Default)]
pub struct NandArgs {
    /// Number of erase blocks in the array.
    pub blocks: usize,
    /// Backing file; loaded on creation, persisted on drop.
    pub file: Option<PathBuf>,
}

/// Raw NAND with program/erase semantics: erase sets a block to 0xff, page
/// data can only be programmed into an erased page, and the spare region
/// programs bitwise (erased bits clear, never set). Bad blocks and one-shot
/// page-write faults can be injected for failure-path testing.
pub struct NandModel {
    blocks: usize,
    data: Vec<u8>,
    spare: Vec<u8>,
    bad_blocks: HashSet<usize>,
    failing_pages: HashSet<usize>,
    file: Option<File>,
}

impl NandModel {
    pub fn new(args: NandArgs) -> Result<Self, std::io::Error> {
        let blocks = args.blocks;
        let mut data = vec![0xffu8; blocks * PAGES_PER_BLOCK * PAGE_SIZE];
        let mut spare = vec![0xffu8; blocks * PAGES_PER_BLOCK * PAGE_SPARE_SIZE];

        let file = if let Some(path) = args.file {
            let mut file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            if file.metadata()?.len() >= (data.len() + spare.len()) as u64 {
                file.rewind()?;
                file.read_exact(&mut data)?;
                file.read_exact(&mut spare)?;
            }
            Some(file)
        } else {
            None
        };

        Ok(NandModel {
            blocks,
            data,
            spare,
            bad_blocks: HashSet::new(),
            failing_pages: HashSet::new(),
            file,
        })
    }

    pub fn page_count(&self) -> usize {
        self.blocks * PAGES_PER_BLOCK
    }

    /// Mark a block factory-bad: erases and programs in it fail.
    pub fn mark_bad_block(&mut self, block: usize) {
        self.bad_blocks.insert(block);
    }

    /// Make the next program of `page` fail.
    pub fn fail_page_write(&mut self, page: usize) {
        self.failing_pages.insert(page);
    }

    /// Corrupt one stored data byte, as a latent bit error would.
    pub fn flip_data_bit(&mut self, page: usize, offset: usize, mask: u8) {
        self.data[page * PAGE_SIZE + offset] ^= mask;
    }

    fn check_page(&self, page: usize) -> Result<(), NandError> {
        if page >= self.page_count() {
            return Err(NandError::OutOfRange(page));
        }
        Ok(())
    }

    fn data_region(&self, page: usize) -> &[u8] {
        &self.data[page * PAGE_SIZE..(page + 1) * PAGE_SIZE]
    }

    fn save_to_file(&mut self) -> Result<(), std::io::Error> {
        if let Some(file) = &mut self.file {
            file.rewind()?;
            file.write_all(&self.data)?;
            file.write_all(&self.spare)?;
        }
        Ok(())
    }
}

impl Drop for NandModel {
    fn drop(&mut self) {
        if let Err(e) = self.save_to_file() {
            log::error!("nand: failed to persist state: {e}");
        }
    }
}

impl NandFlash for NandModel {
    fn erase_block(&mut self, block: usize) -> Result<(), NandError> {
        if block >= self.blocks {
            return Err(NandError::OutOfRange(block * PAGES_PER_BLOCK));
        }
        if self.bad_blocks.contains(&block) {
            return Err(NandError::EraseFailed(block));
        }
        let d = block * PAGES_PER_BLOCK * PAGE_SIZE;
        self.data[d..d + PAGES_PER_BLOCK * PAGE_SIZE].fill(0xff);
        let s = block * PAGES_PER_BLOCK * PAGE_SPARE_SIZE;
        self.spare[s..s + PAGES_PER_BLOCK * PAGE_SPARE_SIZE].fill(0xff);
        Ok(())
    }

    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), NandError> {
        self.check_page(page)?;
        assert_eq!(data.len(), PAGE_SIZE);

        if self.bad_blocks.contains(&(page / PAGES_PER_BLOCK)) || self.failing_pages.remove(&page)
        {
            return Err(NandError::WriteFailed(page));
        }
        if self.data_region(page).iter().any(|&b| b != 0xff) {
            // program without erase
            return Err(NandError::WriteFailed(page));
        }

        self.data[page * PAGE_SIZE..(page + 1) * PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn write_page_spare(&mut self, page: usize, spare: &[u8]) -> Result<(), NandError> {
        self.check_page(page)?;
        assert_eq!(spare.len(), PAGE_SPARE_SIZE);

        if self.bad_blocks.contains(&(page / PAGES_PER_BLOCK)) {
            return Err(NandError::WriteFailed(page));
        }

        let s = page * PAGE_SPARE_SIZE;
        for (stored, &new) in self.spare[s..s + PAGE_SPARE_SIZE].iter_mut().zip(spare) {
            *stored &= new;
        }
        Ok(())
    }

    fn read_page(
        &mut self,
        page: usize,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), NandError> {
        self.check_page(page)?;
        assert_eq!(data.len(), PAGE_SIZE);
        assert_eq!(spare.len(), PAGE_SPARE_SIZE);

        data.copy_from_slice(self.data_region(page));
        let s = page * PAGE_SPARE_SIZE;
        spare.copy_from_slice(&self.spare[s..s + PAGE_SPARE_SIZE]);
        Ok(())
    }

    fn correct_page(
        &mut self,
        page: usize,
        data: &mut [u8],
        spare: &[u8],
    ) -> Result<(), NandError> {
        assert_eq!(data.len(), PAGE_SIZE);

        // The real correction hardware repairs single-bit errors; the model
        // only detects a mismatch and reports it uncorrectable.
        for (i, subpage) in data.chunks_exact(ECC_SUBPAGE_SIZE).enumerate() {
            let off = ECC_SPARE_OFFSET + i * ECC_SIZE;
            let stored = &spare[off..off + ECC_SIZE];
            let computed = calc_ecc(subpage.try_into().unwrap());
            if stored != computed {
                return Err(NandError::Uncorrectable(page));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_ecc::make_page_spare;

    fn model(blocks: usize) -> NandModel {
        NandModel::new(NandArgs {
            blocks,
            file: None,
        })
        .unwrap()
    }

    #[test]
    fn program_requires_erased_page() {
        let mut nand = model(2);
        let data = vec![0x5au8; PAGE_SIZE];

        nand.erase_block(0).unwrap();
        nand.write_page(3, &data).unwrap();
        assert_eq!(nand.write_page(3, &data), Err(NandError::WriteFailed(3)));

        nand.erase_block(0).unwrap();
        nand.write_page(3, &data).unwrap();
    }

    #[test]
    fn spare_pass_and_correction() {
        let mut nand = model(1);
        let data: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 11 + 3) as u8).collect();

        nand.erase_block(0).unwrap();
        nand.write_page(0, &data).unwrap();
        nand.write_page_spare(0, &make_page_spare(&data)).unwrap();

        let mut rd = vec![0u8; PAGE_SIZE];
        let mut spare = vec![0u8; PAGE_SPARE_SIZE];
        nand.read_page(0, &mut rd, &mut spare).unwrap();
        nand.correct_page(0, &mut rd, &spare).unwrap();
        assert_eq!(rd, data);

        // A flipped stored bit must surface as uncorrectable.
        nand.flip_data_bit(0, 100, 0x04);
        nand.read_page(0, &mut rd, &mut spare).unwrap();
        assert_eq!(
            nand.correct_page(0, &mut rd, &spare),
            Err(NandError::Uncorrectable(0))
        );
    }

    #[test]
    fn bad_block_fails_erase_and_program() {
        let mut nand = model(2);
        nand.mark_bad_block(1);
        assert_eq!(nand.erase_block(1), Err(NandError::EraseFailed(1)));
        let data = vec![0u8; PAGE_SIZE];
        assert_eq!(
            nand.write_page(PAGES_PER_BLOCK, &data),
            Err(NandError::WriteFailed(PAGES_PER_BLOCK))
        );
    }

    #[test]
    fn out_of_range_page() {
        let mut nand = model(1);
        let mut data = vec![0u8; PAGE_SIZE];
        let mut spare = vec![0u8; PAGE_SPARE_SIZE];
        assert_eq!(
            nand.read_page(PAGES_PER_BLOCK, &mut data, &mut spare),
            Err(NandError::OutOfRange(PAGES_PER_BLOCK))
        );
    }
}
