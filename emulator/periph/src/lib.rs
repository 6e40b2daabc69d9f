// Licensed under the Apache-2.0 license

//! Software models of the hardware the boot1 update agent drives: the AES
//! engine, the bit-serial EEPROM, the NAND array, and the front-panel
//! buttons. Each model implements the corresponding `boot1-hil` trait;
//! `boot1-hil` forwards the traits through `Rc<RefCell<_>>` so callers can
//! keep an inspection handle while the agent owns the device.

mod aes;
mod buttons;
mod nand;
mod seeprom;

pub use aes::AesModel;
pub use buttons::ButtonScript;
pub use nand::{NandArgs, NandModel};
pub use seeprom::{SeepromArgs, SeepromModel, SEEPROM_SIZE};
