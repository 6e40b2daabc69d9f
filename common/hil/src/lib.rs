// Licensed under the Apache-2.0 license

//! Hardware interfaces for the boot1 update agent.
//!
//! Every piece of hardware the agent touches is reached through one of the
//! traits in this crate, so the installation protocol runs unchanged against
//! either real register-level drivers or the software device models in
//! `emulator-periph`.

use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Maximum number of blocks the AES unit accepts in a single command.
pub const AES_MAX_BLOCKS_PER_CMD: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AesOp {
    Encrypt,
    Decrypt,
}

/// The hardware AES-128-CBC engine.
///
/// The unit holds a key register, an IV latch written through
/// [`AesCore::set_iv`]/[`AesCore::clear_iv`], and a running chaining value.
/// A command with `keep_iv = false` reloads the chaining value from the
/// latch; `keep_iv = true` continues from wherever the previous command left
/// it, which is what lets a caller split a long CBC run across commands.
///
/// Commands block until the unit is done and have no failure signal.
/// Exceeding [`AES_MAX_BLOCKS_PER_CMD`], mismatched buffer lengths, or a
/// length that is not a multiple of [`AES_BLOCK_SIZE`] are contract
/// violations on the caller's side.
pub trait AesCore {
    fn reset(&mut self);
    fn set_key(&mut self, key: &[u8; AES_BLOCK_SIZE]);
    fn set_iv(&mut self, iv: &[u8; AES_BLOCK_SIZE]);
    fn clear_iv(&mut self);

    /// Process `buf` in place. `buf.len()` must be a non-zero multiple of
    /// [`AES_BLOCK_SIZE`] and at most [`AES_MAX_BLOCKS_PER_CMD`] blocks.
    fn run(&mut self, op: AesOp, keep_iv: bool, buf: &mut [u8]);
}

/// One CBC pass over `buf`, split into hardware-sized commands.
///
/// All commands after the first run with `keep_iv` so the chaining value
/// carries across the chunk boundary; the result is identical to a single
/// command over the whole buffer. Key and IV must already be configured on
/// the core.
pub fn cbc_run(core: &mut dyn AesCore, op: AesOp, buf: &mut [u8]) {
    assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);

    let mut keep_iv = false;
    for chunk in buf.chunks_mut(AES_MAX_BLOCKS_PER_CMD * AES_BLOCK_SIZE) {
        core.run(op, keep_iv, chunk);
        keep_iv = true;
    }
}

pub fn cbc_encrypt(core: &mut dyn AesCore, buf: &mut [u8]) {
    cbc_run(core, AesOp::Encrypt, buf);
}

pub fn cbc_decrypt(core: &mut dyn AesCore, buf: &mut [u8]) {
    cbc_run(core, AesOp::Decrypt, buf);
}

/// The four discrete signal lines of the serial EEPROM, plus the inter-bit
/// delay. The protocol itself (framing, opcodes, ready polling) lives in the
/// agent's driver; implementations only move levels.
pub trait EepromPins {
    fn set_cs(&mut self, high: bool);
    fn set_clk(&mut self, high: bool);
    fn set_mosi(&mut self, high: bool);
    fn miso(&mut self) -> bool;
    fn delay(&mut self);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NandError {
    #[error("page {0} is out of range")]
    OutOfRange(usize),
    #[error("uncorrectable ECC error on page {0}")]
    Uncorrectable(usize),
    #[error("write to page {0} failed")]
    WriteFailed(usize),
    #[error("erase of block {0} failed")]
    EraseFailed(usize),
}

/// The raw NAND array and its ECC-correction path.
///
/// Page and spare read/write and block erase belong to the flash controller;
/// `correct_page` is the hardware/boot-ROM correction algorithm. Both are
/// external collaborators of the update agent, which only depends on their
/// contracts.
pub trait NandFlash {
    fn erase_block(&mut self, block: usize) -> Result<(), NandError>;

    /// Program the data region of an erased page.
    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), NandError>;

    /// Program the spare region of a page as a separate pass.
    fn write_page_spare(&mut self, page: usize, spare: &[u8]) -> Result<(), NandError>;

    fn read_page(
        &mut self,
        page: usize,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), NandError>;

    /// Run ECC correction over a page previously read with
    /// [`NandFlash::read_page`]. Returns [`NandError::Uncorrectable`] when
    /// the data cannot be reconstructed.
    fn correct_page(
        &mut self,
        page: usize,
        data: &mut [u8],
        spare: &[u8],
    ) -> Result<(), NandError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

/// Source of the operator's go/no-go decision. Blocks until one of the two
/// recognized events arrives; there is no timeout.
pub trait UserInput {
    fn wait_decision(&mut self) -> Decision;
}

// Shared-handle forwarding: a test or binary can keep an inspection handle
// on a device while the agent drives it through the trait.

impl<T: AesCore> AesCore for Rc<RefCell<T>> {
    fn reset(&mut self) {
        self.borrow_mut().reset()
    }

    fn set_key(&mut self, key: &[u8; AES_BLOCK_SIZE]) {
        self.borrow_mut().set_key(key)
    }

    fn set_iv(&mut self, iv: &[u8; AES_BLOCK_SIZE]) {
        self.borrow_mut().set_iv(iv)
    }

    fn clear_iv(&mut self) {
        self.borrow_mut().clear_iv()
    }

    fn run(&mut self, op: AesOp, keep_iv: bool, buf: &mut [u8]) {
        self.borrow_mut().run(op, keep_iv, buf)
    }
}

impl<T: EepromPins> EepromPins for Rc<RefCell<T>> {
    fn set_cs(&mut self, high: bool) {
        self.borrow_mut().set_cs(high)
    }

    fn set_clk(&mut self, high: bool) {
        self.borrow_mut().set_clk(high)
    }

    fn set_mosi(&mut self, high: bool) {
        self.borrow_mut().set_mosi(high)
    }

    fn miso(&mut self) -> bool {
        self.borrow_mut().miso()
    }

    fn delay(&mut self) {
        self.borrow_mut().delay()
    }
}

impl<T: NandFlash> NandFlash for Rc<RefCell<T>> {
    fn erase_block(&mut self, block: usize) -> Result<(), NandError> {
        self.borrow_mut().erase_block(block)
    }

    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), NandError> {
        self.borrow_mut().write_page(page, data)
    }

    fn write_page_spare(&mut self, page: usize, spare: &[u8]) -> Result<(), NandError> {
        self.borrow_mut().write_page_spare(page, spare)
    }

    fn read_page(
        &mut self,
        page: usize,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), NandError> {
        self.borrow_mut().read_page(page, data, spare)
    }

    fn correct_page(
        &mut self,
        page: usize,
        data: &mut [u8],
        spare: &[u8],
    ) -> Result<(), NandError> {
        self.borrow_mut().correct_page(page, data, spare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-XOR stand-in for a real core; counts issued commands.
    #[derive(Default)]
    struct XorCore {
        key: u8,
        commands: usize,
    }

    impl AesCore for XorCore {
        fn reset(&mut self) {}

        fn set_key(&mut self, key: &[u8; AES_BLOCK_SIZE]) {
            self.key = key[0];
        }

        fn set_iv(&mut self, _iv: &[u8; AES_BLOCK_SIZE]) {}

        fn clear_iv(&mut self) {}

        fn run(&mut self, _op: AesOp, _keep_iv: bool, buf: &mut [u8]) {
            assert!(buf.len() / AES_BLOCK_SIZE <= AES_MAX_BLOCKS_PER_CMD);
            self.commands += 1;
            for b in buf.iter_mut() {
                *b ^= self.key;
            }
        }
    }

    #[test]
    fn cbc_run_splits_at_the_command_limit() {
        let mut core = XorCore {
            key: 0x5a,
            commands: 0,
        };
        let mut buf = vec![0u8; (AES_MAX_BLOCKS_PER_CMD + 1) * AES_BLOCK_SIZE];
        cbc_run(&mut core, AesOp::Encrypt, &mut buf);
        assert_eq!(core.commands, 2);
        assert!(buf.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn shared_handle_forwards_to_the_inner_core() {
        let core = Rc::new(RefCell::new(XorCore::default()));
        let mut handle = core.clone();

        handle.set_key(&[0xa5; AES_BLOCK_SIZE]);
        let mut buf = [0u8; AES_BLOCK_SIZE];
        cbc_encrypt(&mut handle, &mut buf);

        assert_eq!(buf, [0xa5; AES_BLOCK_SIZE]);
        assert_eq!(core.borrow().commands, 1);
    }
}
