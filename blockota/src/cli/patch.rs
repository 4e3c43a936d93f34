// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::BufWriter,
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::format::{bsdiff, imgdiff};

fn apply_subcommand(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let old_data =
        fs::read(&cli.input).with_context(|| format!("Failed to read file: {:?}", cli.input))?;
    let patch_data =
        fs::read(&cli.patch).with_context(|| format!("Failed to read file: {:?}", cli.patch))?;
    let bonus_data = cli
        .bonus_data
        .as_ref()
        .map(|p| fs::read(p).with_context(|| format!("Failed to read file: {p:?}")))
        .transpose()?;

    let mut writer = File::create(&cli.output)
        .map(BufWriter::new)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;

    if patch_data.starts_with(bsdiff::MAGIC) {
        bsdiff::apply(&old_data, &patch_data, &mut writer, cancel_signal)
            .context("Failed to apply bsdiff patch")?;
    } else if patch_data.starts_with(imgdiff::MAGIC) {
        imgdiff::apply(
            &old_data,
            &patch_data,
            bonus_data.as_deref(),
            &mut writer,
            cancel_signal,
        )
        .context("Failed to apply imgdiff patch")?;
    } else {
        bail!("Unknown patch format: {:?}", cli.patch);
    }

    writer
        .into_inner()
        .with_context(|| format!("Failed to flush data: {:?}", cli.output))?;

    Ok(())
}

pub fn patch_main(cli: &PatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        PatchCommand::Apply(c) => apply_subcommand(c, cancel_signal),
    }
}

/// Apply a patch to a file.
///
/// The patch format is detected from its magic bytes. Both bsdiff and imgdiff
/// patches are supported.
#[derive(Debug, Parser)]
struct ApplyCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to patch file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    patch: PathBuf,

    /// Path to bonus data for imgdiff patches.
    ///
    /// Some imgdiff patches for recovery images omit a portion of the
    /// uncompressed target from the patch itself and expect it to be supplied
    /// separately.
    #[arg(short, long, value_name = "FILE", value_parser)]
    bonus_data: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum PatchCommand {
    Apply(ApplyCli),
}

/// Apply bsdiff and imgdiff patches.
#[derive(Debug, Parser)]
pub struct PatchCli {
    #[command(subcommand)]
    command: PatchCommand,
}
