/*++

Licensed under the Apache-2.0 license.

File Name:

    seeprom.rs

Abstract:

    File contains the bit-level model of the Microwire serial EEPROM.

--*/

use boot1_hil::EepromPins;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;

/// Total storage in bytes (256 x 16-bit words).
pub const SEEPROM_SIZE: usize = 0x200;

const WORDS: usize = SEEPROM_SIZE / 2;

/// Clock edges a write stays busy before the ready status bit reads back
/// high. Long enough that the driver's poll loop needs several rounds.
const WRITE_BUSY_CLOCKS: u32 = 24;

#[derive(Clone, Copy, Debug)]
enum Phase {
    /// Hunting for a start bit, then collecting the 11-bit command frame.
    Command { bits: u32, count: u8 },
    /// Shifting out a word read from `addr`.
    ReadOut { shift: u16, remaining: u8 },
    /// Collecting the 16 data bits of a WRITE frame.
    WriteData { addr: u8, bits: u16, count: u8 },
    /// Reporting busy/ready status after a write, until CS drops.
    Status,
    /// Frame handled; ignore further clocks until CS drops.
    Done,
}

#[derive(Default)]
pub struct SeepromArgs {
    /// Backing file; loaded on creation, persisted on drop.
    pub file: Option<PathBuf>,
    /// Initial contents when no backing file exists yet.
    pub raw: Option<[u8; SEEPROM_SIZE]>,
}

/// A 16-bit-organized Microwire EEPROM clocked directly by the four signal
/// lines. Commands: READ (op 10), WRITE (op 01), ERASE (op 11), and the
/// EWEN/EWDS pair (op 00, address prefix 11/00). Writes are gated by the
/// write-enable latch and report busy/ready status bits while CS is held
/// after the data frame.
pub struct SeepromModel {
    data: [u8; SEEPROM_SIZE],
    file: Option<File>,
    phase: Phase,
    cs: bool,
    clk: bool,
    mosi: bool,
    out_bit: bool,
    write_enabled: bool,
    /// Simulated defective/protected part: EWEN is accepted but nothing
    /// programs. The driver's read-back verify is what notices.
    write_protect: bool,
    write_pending: bool,
    busy_clocks: u32,
}

impl SeepromModel {
    pub fn new(args: SeepromArgs) -> Result<Self, std::io::Error> {
        let mut data = args.raw.unwrap_or([0xff; SEEPROM_SIZE]);

        let file = if let Some(path) = args.file {
            let mut file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            if file.metadata()?.len() >= SEEPROM_SIZE as u64 {
                file.rewind()?;
                file.read_exact(&mut data)?;
            }
            Some(file)
        } else {
            None
        };

        Ok(SeepromModel {
            data,
            file,
            phase: Phase::Done,
            cs: false,
            clk: false,
            mosi: false,
            out_bit: false,
            write_enabled: false,
            write_protect: false,
            write_pending: false,
            busy_clocks: 0,
        })
    }

    pub fn contents(&self) -> &[u8; SEEPROM_SIZE] {
        &self.data
    }

    pub fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = protect;
    }

    fn word(&self, addr: u8) -> u16 {
        let i = (addr as usize % WORDS) * 2;
        u16::from_le_bytes([self.data[i], self.data[i + 1]])
    }

    fn set_word(&mut self, addr: u8, value: u16) {
        let i = (addr as usize % WORDS) * 2;
        self.data[i..i + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn program_word(&mut self, addr: u8, value: u16) {
        if self.write_enabled && !self.write_protect {
            self.set_word(addr, value);
        } else {
            log::warn!("seeprom: dropped write to word 0x{addr:02x} (write disabled)");
        }
        self.write_pending = true;
        self.busy_clocks = WRITE_BUSY_CLOCKS;
    }

    fn decode_command(&mut self, bits: u32) {
        let op = (bits >> 8) & 0b11;
        let addr = (bits & 0xff) as u8;
        match op {
            0b10 => {
                self.phase = Phase::ReadOut {
                    shift: self.word(addr),
                    remaining: 16,
                };
            }
            0b01 => {
                self.phase = Phase::WriteData {
                    addr,
                    bits: 0,
                    count: 0,
                };
            }
            0b11 => {
                self.program_word(addr, 0xffff);
                self.phase = Phase::Done;
            }
            _ => {
                match addr >> 6 {
                    0b11 => self.write_enabled = true,
                    0b00 => self.write_enabled = false,
                    other => {
                        // ERAL/WRAL chip-wide ops; the agent never issues
                        // them.
                        log::warn!("seeprom: unsupported op-00 prefix {other:02b}");
                    }
                }
                self.phase = Phase::Done;
            }
        }
    }

    /// Everything happens on the rising clock edge while CS is high: sample
    /// MOSI for command/data bits or shift the next output bit onto MISO.
    fn rising_edge(&mut self) {
        match self.phase {
            Phase::Command { bits, count } => {
                if count == 0 && !self.mosi {
                    // still hunting for the start bit
                    return;
                }
                let bits = (bits << 1) | u32::from(self.mosi);
                let count = count + 1;
                if count == 11 {
                    self.decode_command(bits);
                } else {
                    self.phase = Phase::Command { bits, count };
                }
            }
            Phase::WriteData { addr, bits, count } => {
                let bits = (bits << 1) | u16::from(self.mosi);
                let count = count + 1;
                if count == 16 {
                    self.program_word(addr, bits);
                    self.phase = Phase::Done;
                } else {
                    self.phase = Phase::WriteData { addr, bits, count };
                }
            }
            Phase::ReadOut {
                mut shift,
                remaining,
            } => {
                if remaining > 0 {
                    self.out_bit = shift & 0x8000 != 0;
                    shift <<= 1;
                    self.phase = Phase::ReadOut {
                        shift,
                        remaining: remaining - 1,
                    };
                } else {
                    self.out_bit = false;
                }
            }
            Phase::Status => {
                if self.busy_clocks > 0 {
                    self.busy_clocks -= 1;
                    self.out_bit = false;
                } else {
                    self.out_bit = true;
                }
            }
            Phase::Done => self.out_bit = false,
        }
    }

    fn save_to_file(&mut self) -> Result<(), std::io::Error> {
        if let Some(file) = &mut self.file {
            file.rewind()?;
            file.write_all(&self.data)?;
        }
        Ok(())
    }
}

// Persist the array before the instance goes away.
impl Drop for SeepromModel {
    fn drop(&mut self) {
        if let Err(e) = self.save_to_file() {
            log::error!("seeprom: failed to persist state: {e}");
        }
    }
}

impl EepromPins for SeepromModel {
    fn set_cs(&mut self, high: bool) {
        if high && !self.cs {
            self.phase = if self.write_pending {
                Phase::Status
            } else {
                Phase::Command { bits: 0, count: 0 }
            };
            self.out_bit = false;
        } else if !high && self.cs {
            // The write itself committed at the end of the data frame. The
            // pending status survives that frame's CS drop and is only
            // consumed once a status report has been clocked out.
            if matches!(self.phase, Phase::Status) {
                self.write_pending = false;
            }
            self.phase = Phase::Done;
            self.out_bit = false;
        }
        self.cs = high;
    }

    fn set_clk(&mut self, high: bool) {
        let rising = high && !self.clk;
        self.clk = high;
        if rising && self.cs {
            self.rising_edge();
        }
    }

    fn set_mosi(&mut self, high: bool) {
        self.mosi = high;
    }

    fn miso(&mut self) -> bool {
        self.out_bit
    }

    fn delay(&mut self) {}
}
