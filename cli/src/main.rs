// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use itertools::Itertools;
use owo_colors::OwoColorize;

use edl::gpt::{Partition, sniff_image_format};
use edl::orchestrator::{EdlSession, SessionOptions, open_session, run_flash};
use edl::strategy::AuthKind;
use edl::types::{CancelToken, FirehoseResetMode, FirehoseStorageType};

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

mod events;

use events::ConsoleEvents;

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Dump every partition of a LUN
    Dump {
        #[arg(short, default_value = "out/")]
        outdir: String,

        #[arg(short, long, default_value = "0")]
        lun: u8,
    },

    /// Dump a single partition
    DumpPart {
        #[arg()]
        name: String,

        #[arg(short, default_value = "out/")]
        outdir: String,
    },

    /// Erase a partition
    Erase {
        #[arg()]
        name: String,
    },

    /// Flash a firmware package (a directory with rawprogram*.xml and
    /// patch*.xml, or a single rawprogram file)
    Flash {
        #[arg()]
        firmware: String,
    },

    /// Ask the device to do nothing, hopefully successfully
    Nop,

    /// Print the GPT table
    PrintGpt,

    /// Read a raw sector range into a file
    ReadRange {
        #[arg(value_parser=maybe_hex::<u8>)]
        lun: u8,

        #[arg(value_parser=maybe_hex::<u64>)]
        start_sector: u64,

        #[arg(value_parser=maybe_hex::<u64>)]
        num_sectors: u64,

        #[arg()]
        outfile: String,
    },

    /// Restart the device
    Reset {
        #[arg(default_value = "system", value_name = "edl/off/system")]
        reset_mode: String,
    },

    /// Write a raw image at a sector offset
    WriteRange {
        #[arg(value_parser=maybe_hex::<u8>)]
        lun: u8,

        #[arg(value_parser=maybe_hex::<u64>)]
        start_sector: u64,

        #[arg()]
        file_path: String,
    },

    /// Mark physical storage partition as bootable
    SetBootablePart {
        #[arg()]
        idx: u8,
    },

    /// Write a partition
    Write {
        #[arg()]
        part_name: String,

        #[arg()]
        file_path: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, help = "E.g. COM4 on Windows")]
    dev_path: String,

    #[arg(short, long, value_name = "FILE")]
    loader_path: Option<String>,

    #[arg(long, value_name = "DIR", help = "Searched for a matching programmer")]
    loader_dir: Option<String>,

    #[arg(short, long, default_value = "standard", value_name = "standard/vip/xiaomi")]
    auth: String,

    #[arg(long, value_name = "FILE")]
    vip_digest: Option<String>,

    #[arg(long, value_name = "FILE")]
    vip_signature: Option<String>,

    #[arg(long, value_name = "DIR")]
    xiaomi_sig_dir: Option<String>,

    #[arg(short, long, default_value = "ufs", value_name = "emmc/ufs/nvme")]
    storage_type: String,

    #[arg(long)]
    sector_size: Option<usize>,

    #[arg(
        long,
        default_value = "false",
        help = "Required for unprovisioned storage media."
    )]
    skip_storage_init: bool,

    #[arg(
        short = 'A',
        long,
        default_value = "false",
        help = "Work around missing HELLO packet"
    )]
    skip_hello_wait: bool,

    #[arg(
        long,
        default_value = "false",
        help = "Allow writes to LUN 5 (RPMB). You probably don't want this."
    )]
    allow_lun5: bool,

    /// Reset target after the command finishes
    #[arg(long, default_value = "edl", value_name = "edl/off/system")]
    reset_mode: String,

    #[arg(long, default_value = "false")]
    print_firehose_log: bool,

    #[command(subcommand)]
    command: Command,
}

fn print_gpt(session: &EdlSession) {
    let gpt = session.partition_table();
    println!(
        "{} partitions on LUNs {}:",
        gpt.len().bright_yellow(),
        gpt.luns().format(", ").bright_yellow()
    );

    for lun in gpt.luns().collect::<Vec<_>>() {
        for (idx, part) in gpt.partitions(lun).iter().enumerate() {
            println!(
                "{}/{}] {}: start_sector = {}, {} bytes ({} kiB) {}",
                lun,
                idx,
                part.name.as_str(),
                part.start_lba,
                part.size_bytes(),
                part.size_bytes() / 1024,
                part.type_guid.to_string().bright_black(),
            );
        }
    }
}

fn dump_partition_to(session: &mut EdlSession, part: &Partition, outdir: &Path) -> Result<()> {
    let path = outdir.join(&part.name);
    let mut out = File::create(&path)?;
    session.read_range(part.lun, part.start_lba, part.sectors, &part.name, &mut out)?;

    // Sniff what we just pulled, for the operator's benefit
    let mut head = vec![0u8; 4096.min(part.size_bytes() as usize)];
    let mut f = File::open(&path)?;
    f.read_exact(&mut head)?;
    match sniff_image_format(&head) {
        Some(kind) => println!("{}: {}", part.name, kind.bright_green()),
        None => println!("{}: {}", part.name, "raw".bright_black()),
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let reset_mode = FirehoseResetMode::from_str(&args.reset_mode)?;

    let opts = SessionOptions {
        dev_path: args.dev_path,
        loader_path: args.loader_path.map(PathBuf::from),
        loader_dir: args.loader_dir.map(PathBuf::from),
        auth: AuthKind::from_str(&args.auth)?,
        vip_digest_path: args.vip_digest.map(PathBuf::from),
        vip_signature_path: args.vip_signature.map(PathBuf::from),
        xiaomi_sig_dir: args.xiaomi_sig_dir.map(PathBuf::from),
        storage_type: FirehoseStorageType::from_str(&args.storage_type)?,
        sector_size: args.sector_size,
        protect_lun5: !args.allow_lun5,
        skip_storage_init: args.skip_storage_init,
        skip_hello_wait: args.skip_hello_wait,
        skip_firehose_log: !args.print_firehose_log,
        reset_mode,
    };

    println!(
        "{} {}",
        env!("CARGO_PKG_NAME").green(),
        env!("CARGO_PKG_VERSION").yellow()
    );

    let events = ConsoleEvents::new(false);
    let cancel = CancelToken::new();

    // The full flash pipeline reports through a structured outcome instead
    // of bubbling errors, so handle it before opening a plain session
    if let Command::Flash { firmware } = &args.command {
        let outcome = run_flash(&opts, Path::new(firmware), &events, &cancel);

        if outcome.requires_user_action {
            println!("{}", "Operator action required:".yellow());
            println!("{}", outcome.user_guidance.unwrap_or_default());
            return Ok(());
        }

        if !outcome.success {
            bail!(
                "flash failed during {}: {}",
                outcome
                    .failed_phase
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "startup".to_owned()),
                outcome.error_message.unwrap_or_default()
            );
        }

        println!(
            "{} {} partitions in {:.1?}",
            "Flashed".bright_green(),
            outcome.partitions_written,
            outcome.elapsed
        );
        return Ok(());
    }

    let mut session = open_session(&opts, &events, &cancel)?;

    match &args.command {
        Command::Flash { .. } => unreachable!("handled above"),
        Command::Dump { outdir, lun } => {
            fs::create_dir_all(outdir)?;
            let outpath = Path::new(outdir);

            let parts: Vec<Partition> = session
                .partition_table()
                .partitions(*lun)
                .iter()
                .filter(|p| !p.name.is_empty() && p.sectors > 0)
                .cloned()
                .collect();

            for part in &parts {
                dump_partition_to(&mut session, part, outpath)?;
            }
        }
        Command::DumpPart { name, outdir } => {
            fs::create_dir_all(outdir)?;
            let part = session.find_partition(name)?;
            dump_partition_to(&mut session, &part, Path::new(outdir))?;
        }
        Command::Erase { name } => session.erase_partition(name)?,
        Command::Nop => println!(
            "Your nop was {}",
            session
                .nop()
                .map(|_| "successful".bright_green())
                .map_err(|_| "unsuccessful".bright_red())
                .unwrap()
        ),
        Command::PrintGpt => print_gpt(&session),
        Command::ReadRange {
            lun,
            start_sector,
            num_sectors,
            outfile,
        } => {
            let mut out = File::create(outfile)?;
            session.read_range(*lun, *start_sector, *num_sectors, "raw", &mut out)?;
        }
        Command::Reset { reset_mode } => {
            session.reset(FirehoseResetMode::from_str(reset_mode)?)?;
            return Ok(());
        }
        Command::SetBootablePart { idx } => session.set_bootable(*idx)?,
        Command::Write {
            part_name,
            file_path,
        } => session.write_partition(part_name, Path::new(file_path))?,
        Command::WriteRange {
            lun,
            start_sector,
            file_path,
        } => session.write_range(*lun, *start_sector, Path::new(file_path))?,
    };

    // Finally, reset the device
    session.reset(reset_mode)?;

    println!(
        "{} {}",
        "All went well! Resetting to".green(),
        reset_mode.to_string().bright_yellow()
    );

    Ok(())
}
