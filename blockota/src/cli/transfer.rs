// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::Cursor,
    path::PathBuf,
    str,
    sync::atomic::AtomicBool,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{package::open_package, status},
    engine::{self, ApplyConfig},
    format::{package, transferlist::TransferList},
};

fn parse_transfer_list(data: &[u8], name: &str) -> Result<TransferList> {
    let text =
        str::from_utf8(data).with_context(|| format!("Transfer list is not UTF-8: {name:?}"))?;
    let list = TransferList::parse(text)
        .with_context(|| format!("Failed to parse transfer list: {name:?}"))?;

    Ok(list)
}

fn apply_subcommand(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut package_reader = open_package(&cli.input, cancel_signal)?;

    let list_data = package::read_zip_entry(&mut package_reader, &cli.transfer_list)
        .with_context(|| format!("Failed to read package entry: {:?}", cli.transfer_list))?;
    let new_data = package::read_zip_entry(&mut package_reader, &cli.new_data)
        .with_context(|| format!("Failed to read package entry: {:?}", cli.new_data))?;
    let patch_data = package::read_zip_entry(&mut package_reader, &cli.patch_data)
        .with_context(|| format!("Failed to read package entry: {:?}", cli.patch_data))?;

    let list = parse_transfer_list(&list_data, &cli.transfer_list)?;

    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.target)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.target))?;

    let config = ApplyConfig {
        starvation_timeout: Duration::from_secs(cli.new_data_timeout),
    };

    status!("Applying {} commands", list.commands().len());

    let mut patch_reader = Cursor::new(patch_data);

    engine::apply(
        &list,
        &target,
        Cursor::new(new_data),
        &mut patch_reader,
        &cli.stash_dir,
        &cli.record,
        &config,
        cancel_signal,
    )
    .with_context(|| format!("Failed to apply update to: {:?}", cli.target))?;

    status!("Successfully applied update to {:?}", cli.target);

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut package_reader = open_package(&cli.input, cancel_signal)?;

    let list_data = package::read_zip_entry(&mut package_reader, &cli.transfer_list)
        .with_context(|| format!("Failed to read package entry: {:?}", cli.transfer_list))?;

    let list = parse_transfer_list(&list_data, &cli.transfer_list)?;

    let target = File::open(&cli.target)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.target))?;

    status!("Verifying {} commands", list.commands().len());

    engine::verify_applied(&list, &target, &cli.stash_dir, &cli.record, cancel_signal)
        .with_context(|| format!("Failed to verify target: {:?}", cli.target))?;

    status!("Target is in the expected state");

    Ok(())
}

pub fn transfer_main(cli: &TransferCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        TransferCommand::Apply(c) => apply_subcommand(c, cancel_signal),
        TransferCommand::Verify(c) => verify_subcommand(c, cancel_signal),
    }
}

/// Apply an update's transfer list to a target block device or image.
///
/// Progress is recorded after every fsynced write. If the run is interrupted,
/// rerunning the same command resumes where it left off.
#[derive(Debug, Parser)]
struct ApplyCli {
    /// Path to update package.
    ///
    /// A value of @FILE treats FILE as a block map and reads the package
    /// contents from the mapped ranges of the device it names.
    #[arg(short, long, value_name = "PATH")]
    input: String,

    /// Path to target block device or image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    target: PathBuf,

    /// Name of the transfer list entry in the package.
    #[arg(long, value_name = "NAME", default_value = "system.transfer.list")]
    transfer_list: String,

    /// Name of the new data entry in the package.
    #[arg(long, value_name = "NAME", default_value = "system.new.dat")]
    new_data: String,

    /// Name of the patch data entry in the package.
    #[arg(long, value_name = "NAME", default_value = "system.patch.dat")]
    patch_data: String,

    /// Directory for stash files.
    ///
    /// Stashed blocks must survive an interrupted run, so this should be on
    /// persistent storage, not a tmpfs.
    #[arg(long, value_name = "DIR", value_parser)]
    stash_dir: PathBuf,

    /// Path to progress record file.
    #[arg(long, value_name = "FILE", value_parser)]
    record: PathBuf,

    /// Seconds to wait for new data before considering the decoder stalled.
    #[arg(long, value_name = "SECONDS", default_value = "30")]
    new_data_timeout: u64,
}

/// Check whether a target matches an update's expected state.
///
/// Every modified range must contain either its before or after contents
/// (or a stashed copy of the before contents). On success, applying the
/// update is guaranteed to be possible, resuming from the recorded progress
/// if there is any.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to update package.
    ///
    /// A value of @FILE treats FILE as a block map and reads the package
    /// contents from the mapped ranges of the device it names.
    #[arg(short, long, value_name = "PATH")]
    input: String,

    /// Path to target block device or image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    target: PathBuf,

    /// Name of the transfer list entry in the package.
    #[arg(long, value_name = "NAME", default_value = "system.transfer.list")]
    transfer_list: String,

    /// Directory for stash files.
    #[arg(long, value_name = "DIR", value_parser)]
    stash_dir: PathBuf,

    /// Path to progress record file.
    #[arg(long, value_name = "FILE", value_parser)]
    record: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TransferCommand {
    Apply(ApplyCli),
    Verify(VerifyCli),
}

/// Apply and verify block-based updates.
#[derive(Debug, Parser)]
pub struct TransferCli {
    #[command(subcommand)]
    command: TransferCommand,
}
