// Licensed under the Apache-2.0 license

use anyhow::Context;
use boot1_hil::{Decision, UserInput};
use boot1_updater::crypto::OtpKeys;
use boot1_updater::params::{Boot1Params, ParamStore};
use boot1_updater::{run, InstallOptions, UpdaterEnv};
use clap::Parser;
use emulator_periph::{AesModel, NandArgs, NandModel, SeepromArgs, SeepromModel};
use std::io::{BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "boot1-updater",
    about = "Flash and activate a boot1 image against the emulated console devices"
)]
struct Args {
    /// Candidate boot1 ancast image, exactly one NAND boot block.
    #[arg(long)]
    image: PathBuf,

    /// SEEPROM state file, created on first use.
    #[arg(long, default_value = "seeprom.bin")]
    seeprom_state: PathBuf,

    /// NAND state file, created on first use.
    #[arg(long, default_value = "nand.bin")]
    nand_state: PathBuf,

    /// Number of NAND erase blocks to model.
    #[arg(long, default_value_t = 64)]
    nand_blocks: usize,

    /// 32-byte OTP key dump (SEEPROM bank key, then ancast body key).
    /// Development keys when omitted.
    #[arg(long)]
    otp: Option<PathBuf>,

    /// Provision fresh parameter slots before installing.
    #[arg(long)]
    seed_params: bool,

    /// Repoint the boot ROM at the new slot once it verifies.
    #[arg(long)]
    commit: bool,

    /// Invalidate the previous slot after committing the new one.
    #[arg(long, requires = "commit")]
    retire_previous: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Operator confirmation over stdin.
struct ConsoleInput;

impl UserInput for ConsoleInput {
    fn wait_decision(&mut self) -> Decision {
        let stdin = std::io::stdin();
        loop {
            eprint!("proceed with the installation? [y/N] ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                return Decision::Cancel;
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Decision::Confirm,
                "" | "n" | "no" => return Decision::Cancel,
                _ => eprintln!("answer y or n"),
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;

    let keys = match &args.otp {
        Some(path) => OtpKeys::load(path)
            .with_context(|| format!("reading OTP dump {}", path.display()))?,
        None => {
            log::info!("no OTP dump given, using development keys");
            OtpKeys::development()
        }
    };

    let mut seeprom = SeepromModel::new(SeepromArgs {
        file: Some(args.seeprom_state.clone()),
        raw: None,
    })
    .with_context(|| format!("opening SEEPROM state {}", args.seeprom_state.display()))?;
    let nand = NandModel::new(NandArgs {
        blocks: args.nand_blocks,
        file: Some(args.nand_state.clone()),
    })
    .with_context(|| format!("opening NAND state {}", args.nand_state.display()))?;
    let mut aes = AesModel::new();

    if args.seed_params {
        anyhow::ensure!(
            args.nand_blocks > 2,
            "seeding parameters needs at least 3 NAND blocks"
        );
        // Slot 0 at block 1, slot 1 at block 2, both in the primary bank.
        let store = ParamStore::from_records([
            Boot1Params::new(0x1001, 1),
            Boot1Params::new(0x1002, 2),
        ]);
        store.store_all(&mut seeprom, &mut aes, &keys.seeprom_key)?;
        log::info!("seeded parameter slots at blocks 1 and 2");
    }

    let mut env = UpdaterEnv {
        nand: Box::new(nand),
        aes: Box::new(aes),
        eeprom: Box::new(seeprom),
        input: Box::new(ConsoleInput),
        keys,
    };

    let opts = InstallOptions {
        image: args.image,
        commit: args.commit,
        retire_previous: args.retire_previous,
    };
    run(&mut env, &opts)?;
    Ok(())
}
