/*++

Licensed under the Apache-2.0 license.

File Name:

    aes.rs

Abstract:

    File contains the emulated AES-128-CBC engine.

--*/

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use boot1_hil::{AesCore, AesOp, AES_BLOCK_SIZE, AES_MAX_BLOCKS_PER_CMD};

/// The hardware unit keeps a key register, an IV latch written by software,
/// and a running chaining value. A command issued without `keep_iv` reloads
/// the chain from the latch; with `keep_iv` it continues from the previous
/// command, which is how long transfers are chunked.
pub struct AesModel {
    cipher: Option<Aes128>,
    iv_latch: [u8; AES_BLOCK_SIZE],
    chain: [u8; AES_BLOCK_SIZE],
}

impl AesModel {
    pub fn new() -> Self {
        AesModel {
            cipher: None,
            iv_latch: [0; AES_BLOCK_SIZE],
            chain: [0; AES_BLOCK_SIZE],
        }
    }
}

impl Default for AesModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AesCore for AesModel {
    fn reset(&mut self) {
        self.iv_latch = [0; AES_BLOCK_SIZE];
        self.chain = [0; AES_BLOCK_SIZE];
    }

    fn set_key(&mut self, key: &[u8; AES_BLOCK_SIZE]) {
        self.cipher = Some(Aes128::new(GenericArray::from_slice(key)));
    }

    fn set_iv(&mut self, iv: &[u8; AES_BLOCK_SIZE]) {
        self.iv_latch = *iv;
    }

    fn clear_iv(&mut self) {
        self.iv_latch = [0; AES_BLOCK_SIZE];
    }

    fn run(&mut self, op: AesOp, keep_iv: bool, buf: &mut [u8]) {
        assert_eq!(buf.len() % AES_BLOCK_SIZE, 0, "partial AES block");
        assert!(
            buf.len() / AES_BLOCK_SIZE <= AES_MAX_BLOCKS_PER_CMD,
            "command exceeds hardware block limit"
        );
        let cipher = self.cipher.as_ref().expect("AES command without a key");

        if !keep_iv {
            self.chain = self.iv_latch;
        }

        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            match op {
                AesOp::Encrypt => {
                    for (b, c) in block.iter_mut().zip(self.chain.iter()) {
                        *b ^= c;
                    }
                    cipher.encrypt_block(GenericArray::from_mut_slice(block));
                    self.chain.copy_from_slice(block);
                }
                AesOp::Decrypt => {
                    let ct: [u8; AES_BLOCK_SIZE] = block.try_into().unwrap();
                    cipher.decrypt_block(GenericArray::from_mut_slice(block));
                    for (b, c) in block.iter_mut().zip(self.chain.iter()) {
                        *b ^= c;
                    }
                    self.chain = ct;
                }
            }
        }
    }
}
