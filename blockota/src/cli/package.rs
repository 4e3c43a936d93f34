// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::File,
    io::{BufReader, Cursor},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::status,
    crypto::{self, PassphraseSource},
    format::{blockmap, package},
    stream::ReadSeek,
};

/// Open a package for reading. A spec beginning with `@` names a block map
/// file and the package contents are assembled in memory from the mapped
/// ranges of the underlying device. Any other spec is opened as a plain file.
pub fn open_package(spec: &str, cancel_signal: &AtomicBool) -> Result<Box<dyn ReadSeek>> {
    if spec.starts_with('@') {
        let data = blockmap::load_image(spec, cancel_signal)
            .with_context(|| format!("Failed to load package: {spec:?}"))?;

        Ok(Box::new(Cursor::new(data)))
    } else {
        let file = File::open(spec)
            .with_context(|| format!("Failed to open for reading: {spec:?}"))?;

        Ok(Box::new(BufReader::new(file)))
    }
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut certs = Vec::with_capacity(cli.cert.len());
    for path in &cli.cert {
        let cert = crypto::read_pem_cert_file(path)
            .with_context(|| format!("Failed to load certificate: {path:?}"))?;
        certs.push(cert);
    }

    let reader = open_package(&cli.input, cancel_signal)?;

    status!("Verifying whole-file signature");

    let index = package::verify_package(reader, &certs, cancel_signal)
        .with_context(|| format!("Failed to verify package: {:?}", cli.input))?;

    status!("Signature is valid and trusted by: {:?}", cli.cert[index]);

    Ok(())
}

fn sign_subcommand(cli: &SignCli, cancel_signal: &AtomicBool) -> Result<()> {
    let source = if let Some(v) = &cli.pass_env_var {
        Some(PassphraseSource::EnvVar(v.clone()))
    } else {
        cli.pass_file
            .as_ref()
            .map(|p| PassphraseSource::File(p.clone()))
    };

    let key = crypto::read_pem_key_file(&cli.key, source.as_ref())
        .with_context(|| format!("Failed to load key: {:?}", cli.key))?;
    let cert = crypto::read_pem_cert_file(&cli.cert)
        .with_context(|| format!("Failed to load certificate: {:?}", cli.cert))?;

    let reader = open_package(&cli.input, cancel_signal)?;
    let writer = File::create(&cli.output)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;

    status!("Signing package");

    package::sign_package(reader, &writer, &key, &cert, cancel_signal)
        .with_context(|| format!("Failed to sign package: {:?}", cli.input))?;

    writer
        .sync_all()
        .with_context(|| format!("Failed to flush data: {:?}", cli.output))?;

    Ok(())
}

fn info_subcommand(cli: &InfoCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = open_package(&cli.input, cancel_signal)?;

    let info = package::parse_package_sig(reader)
        .with_context(|| format!("Failed to parse package signature: {:?}", cli.input))?;

    println!("Signed length:    {} bytes", info.signed_len);
    println!("Comment size:     {} bytes", info.comment_size);
    println!("Signature offset: {} bytes from end", info.signature_start);

    for (index, cert) in crypto::iter_cms_certs(&info.signed_data).enumerate() {
        println!("Embedded certificate #{index}:");
        println!("  Subject: {}", cert.tbs_certificate.subject);
        println!("  Serial:  {}", cert.tbs_certificate.serial_number);
    }

    Ok(())
}

pub fn package_main(cli: &PackageCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        PackageCommand::Verify(c) => verify_subcommand(c, cancel_signal),
        PackageCommand::Sign(c) => sign_subcommand(c, cancel_signal),
        PackageCommand::Info(c) => info_subcommand(c, cancel_signal),
    }
}

/// Verify the whole-file signature of a package.
///
/// The signature must have been produced by one of the specified trusted
/// certificates. Embedded certificates in the package are ignored.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to package.
    ///
    /// A value of @FILE treats FILE as a block map and reads the package
    /// contents from the mapped ranges of the device it names.
    #[arg(short, long, value_name = "PATH")]
    input: String,

    /// Trusted certificate.
    ///
    /// Can be specified multiple times.
    #[arg(short, long, value_name = "FILE", value_parser, required = true)]
    cert: Vec<PathBuf>,
}

/// Sign a package with a whole-file signature.
///
/// The signature is stored in the zip archive comment, leaving every other
/// byte of the package untouched. The input must not already have an archive
/// comment.
#[derive(Debug, Parser)]
struct SignCli {
    /// Path to input package.
    #[arg(short, long, value_name = "PATH")]
    input: String,

    /// Path to output package.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Private key for signing the package.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: PathBuf,

    /// Certificate for the signing key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    cert: PathBuf,

    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pass_file: Option<PathBuf>,
}

/// Display information about a package's signature.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to package.
    #[arg(short, long, value_name = "PATH")]
    input: String,
}

#[derive(Debug, Subcommand)]
enum PackageCommand {
    Verify(VerifyCli),
    Sign(SignCli),
    Info(InfoCli),
}

/// Verify, sign, and inspect update packages.
#[derive(Debug, Parser)]
pub struct PackageCli {
    #[command(subcommand)]
    command: PackageCommand,
}
