// Licensed under the Apache-2.0 license

//! Update agent for the console's boot1 second-stage loader.
//!
//! boot1 lives in one NAND boot block, selected at power-on through a pair
//! of redundant parameter records in the serial EEPROM. The agent flashes a
//! candidate image into the slot the ROM is *not* booting from, verifies it
//! in place, and only then (behind an explicit gate) repoints the parameter
//! records. A crash at any step leaves the previously booting slot intact.

pub mod crypto;
pub mod install;
pub mod params;
pub mod seeprom;

pub use install::{run, InstallError, InstallOptions, UpdaterEnv};
