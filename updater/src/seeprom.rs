/*++

Licensed under the Apache-2.0 license.

File Name:

    seeprom.rs

Abstract:

    File contains the bit-banged driver for the Microwire serial EEPROM.

--*/

use boot1_hil::EepromPins;
use thiserror::Error;

/// Status poll rounds allowed per written word. The part normally reports
/// ready within a few rounds; running out is not treated as an error because
/// the read-back verify is the actual success signal.
const WRITE_POLL_ROUNDS: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeepromError {
    #[error("word 0x{addr:02x} read back 0x{read:04x} after writing 0x{wrote:04x}")]
    WriteVerifyFailed { addr: u8, wrote: u16, read: u16 },
}

/// Protocol driver over the four raw signal lines.
///
/// Frames are shifted MSB-first under a software-toggled clock: a start bit,
/// a 2-bit opcode, and an 8-bit word address, followed by 16 data bits in
/// the direction the opcode implies. Each frame runs under its own CS
/// assertion.
pub struct Seeprom<'a> {
    pins: &'a mut dyn EepromPins,
}

impl<'a> Seeprom<'a> {
    pub fn new(pins: &'a mut dyn EepromPins) -> Self {
        pins.set_clk(false);
        pins.set_cs(false);
        pins.delay();
        Seeprom { pins }
    }

    fn send_bits(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            self.pins.set_mosi(value & (1 << i) != 0);
            self.pins.set_clk(true);
            self.pins.delay();
            self.pins.set_clk(false);
            self.pins.delay();
        }
    }

    fn recv_bits(&mut self, bits: u32) -> u32 {
        let mut out = 0;
        for _ in 0..bits {
            self.pins.set_clk(true);
            self.pins.delay();
            out = (out << 1) | u32::from(self.pins.miso());
            self.pins.set_clk(false);
            self.pins.delay();
        }
        out
    }

    /// One 11-bit control frame with no data phase (EWEN, EWDS).
    fn control(&mut self, op: u32, addr: u8) {
        self.pins.set_cs(true);
        self.send_bits((1 << 10) | (op << 8) | u32::from(addr), 11);
        self.pins.set_cs(false);
        self.pins.delay();
    }

    /// Read consecutive 16-bit words starting at word address `offset`.
    pub fn read(&mut self, offset: u8, out: &mut [u16]) {
        for (i, word) in out.iter_mut().enumerate() {
            self.pins.set_cs(true);
            self.send_bits((1 << 10) | (0b10 << 8) | u32::from(offset.wrapping_add(i as u8)), 11);
            *word = self.recv_bits(16) as u16;
            self.pins.set_cs(false);
            self.pins.delay();
        }
    }

    /// Write consecutive words, then read every one back and compare.
    ///
    /// The part silently drops programs when its write-enable latch is off
    /// or the array is protected, and the busy/ready status only paces the
    /// transfer, so the read-back comparison is the one signal that the data
    /// actually landed.
    pub fn write(&mut self, offset: u8, words: &[u16]) -> Result<(), SeepromError> {
        self.control(0b00, 0b1100_0000); // EWEN

        for (i, &word) in words.iter().enumerate() {
            let addr = offset.wrapping_add(i as u8);

            self.pins.set_cs(true);
            self.send_bits(
                (1 << 26) | (0b01 << 24) | (u32::from(addr) << 16) | u32::from(word),
                27,
            );
            self.pins.set_cs(false);
            self.pins.delay();

            self.pins.set_cs(true);
            for _ in 0..WRITE_POLL_ROUNDS {
                if self.recv_bits(10) & 1 == 1 {
                    break;
                }
            }
            self.pins.set_cs(false);
            self.pins.delay();
        }

        self.control(0b00, 0b0000_0000); // EWDS

        for (i, &word) in words.iter().enumerate() {
            let addr = offset.wrapping_add(i as u8);
            let mut read = [0u16];
            self.read(addr, &mut read);
            if read[0] != word {
                return Err(SeepromError::WriteVerifyFailed {
                    addr,
                    wrote: word,
                    read: read[0],
                });
            }
        }
        Ok(())
    }
}
