// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::{completion, key, package, patch, transfer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_possible_value().ok_or(fmt::Error)?.get_name())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Level and message only.
    #[default]
    Short,
    /// Timestamp, level, target, and message.
    Long,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_possible_value().ok_or(fmt::Error)?.get_name())
    }
}

/// Initialize the global tracing subscriber. Log messages go to stderr so
/// that they don't interfere with command output on stdout.
pub fn init_logging(log_level: LogLevel, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(LevelFilter::from(log_level));

    match log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Long => builder.init(),
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    Completion(completion::CompletionCli),
    Key(key::KeyCli),
    Package(package::PackageCli),
    Patch(patch::PatchCli),
    Transfer(transfer::TransferCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest logging message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t)]
    pub log_level: LogLevel,

    /// Output format for logging messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t)]
    pub log_format: LogFormat,
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Completion(c) => completion::completion_main(&c),
        Command::Key(c) => key::key_main(&c),
        Command::Package(c) => package::package_main(&c, cancel_signal),
        Command::Patch(c) => patch::patch_main(&c, cancel_signal),
        Command::Transfer(c) => transfer::transfer_main(&c, cancel_signal),
    }
}
