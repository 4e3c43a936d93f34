// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use cms::signed_data::SignedData;
use memchr::memmem;
use ring::digest::Context;
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::debug;
use x509_cert::{Certificate, der::Encode};
use zip::{ZipArchive, result::ZipError};

use crate::{
    crypto::{self, SignatureAlgorithm},
    stream,
};

pub const ZIP_EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";

/// Size of the signature footer at the end of the archive comment.
const FOOTER_SIZE: u16 = 6;
/// Size of a non-zip64 EOCD record with an empty archive comment.
const EOCD_SIZE_NO_COMMENT: u16 = 22;

const COMMENT_MESSAGE: &[u8] = b"signed by blockota\0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot find signature footer magic")]
    FooterMagicNotFound,
    #[error("Signature start ({0}) is within the footer")]
    SignatureInFooter(u16),
    #[error("Signature start ({signature_start}) exceeds archive comment size ({comment_size})")]
    SignatureOffsetTooLarge {
        signature_start: u16,
        comment_size: u16,
    },
    #[error("Package too small to contain EOCD")]
    PackageTooSmall,
    #[error("Cannot find EOCD magic")]
    EocdMagicNotFound,
    #[error("EOCD magic found in archive comment")]
    EocdMagicInComment,
    #[error("CMS structure contains no SignerInfo")]
    NoCmsSignerInfo,
    #[error("No certificates supplied for verification")]
    NoCertificates,
    #[error("Signature does not match any of the {0} supplied certificates")]
    NoMatchingCertificate(usize),
    #[error("Certificate does not match the private key")]
    KeyMismatch,
    #[error("Input archive already has a comment")]
    InputHasComment,
    #[error("Archive comment too large: {0} bytes")]
    CommentTooLarge(usize),
    #[error("Missing entry in package: {0:?}")]
    MissingEntry(String),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("x509 DER error")]
    Der(#[from] x509_cert::der::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Signature metadata parsed from the end of a package.
#[derive(Debug)]
pub struct SignatureInfo {
    /// Offset of the PKCS#7 structure, counted backwards from the end of the
    /// file.
    pub signature_start: u16,
    /// Size of the zip archive comment holding the signature.
    pub comment_size: u16,
    /// Length of the file prefix covered by the signature.
    pub signed_len: u64,
    /// The decoded PKCS#7 structure. Used purely as a transport for the raw
    /// signature bytes; signed attributes are not supported.
    pub signed_data: SignedData,
}

/// Parse the whole-file signature from the end of a package. The footer is
/// the last 6 bytes of the zip archive comment: the signature offset from the
/// end of the file, the magic value 0xffff, and the comment size, all
/// little-endian u16s. This does not parse any zip data structures.
pub fn parse_package_sig(mut reader: impl Read + Seek) -> Result<SignatureInfo> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < u64::from(FOOTER_SIZE) {
        return Err(Error::PackageTooSmall);
    }

    reader.seek(SeekFrom::Current(-i64::from(FOOTER_SIZE)))?;
    let mut footer = [0u8; 6];
    reader.read_exact(&mut footer)?;

    let signature_start = u16::from_le_bytes(footer[0..2].try_into().unwrap());
    let sig_magic = u16::from_le_bytes(footer[2..4].try_into().unwrap());
    let comment_size = u16::from_le_bytes(footer[4..6].try_into().unwrap());

    if sig_magic != 0xffff {
        return Err(Error::FooterMagicNotFound);
    }
    if signature_start <= FOOTER_SIZE {
        return Err(Error::SignatureInFooter(signature_start));
    }
    if signature_start > comment_size {
        return Err(Error::SignatureOffsetTooLarge {
            signature_start,
            comment_size,
        });
    }

    // signapk always produces a non-zip64 EOCD, so only the 22-byte fixed
    // portion plus the comment needs to be considered.
    let eocd_size = u64::from(EOCD_SIZE_NO_COMMENT) + u64::from(comment_size);
    if file_size < eocd_size {
        return Err(Error::PackageTooSmall);
    }

    reader.seek(SeekFrom::Start(file_size - eocd_size))?;
    let mut eocd = vec![0u8; eocd_size as usize];
    reader.read_exact(&mut eocd)?;

    // The magic must start the EOCD and must not occur anywhere afterwards.
    // Otherwise, the signed prefix of the file could be reinterpreted as a
    // different archive with a shifted central directory.
    let mut eocd_magic_iter = memmem::find_iter(&eocd, ZIP_EOCD_MAGIC);
    if eocd_magic_iter.next() != Some(0) {
        return Err(Error::EocdMagicNotFound);
    }
    if eocd_magic_iter.next().is_some() {
        return Err(Error::EocdMagicInComment);
    }

    let sig_offset = eocd_size as usize - usize::from(signature_start);
    let signed_data =
        crypto::parse_cms(&eocd[sig_offset..eocd_size as usize - usize::from(FOOTER_SIZE)])?;

    // The signature covers everything aside from the archive comment and its
    // length field.
    let signed_len = file_size - 2 - u64::from(comment_size);

    Ok(SignatureInfo {
        signature_start,
        comment_size,
        signed_len,
        signed_data,
    })
}

/// Verify a package's whole-file signature against a set of trusted
/// certificates. The embedded CMS certificates are ignored; only the raw
/// signature bytes from the first SignerInfo are checked. The signed region
/// is always hashed in full, once, computing every digest some candidate
/// certificate needs. Returns the index of the first matching certificate.
pub fn verify_package(
    mut reader: impl Read + Seek,
    certs: &[Certificate],
    cancel_signal: &AtomicBool,
) -> Result<usize> {
    if certs.is_empty() {
        return Err(Error::NoCertificates);
    }

    let info = parse_package_sig(&mut reader)?;
    let signature = crypto::cms_signature_bytes(&info.signed_data).ok_or(Error::NoCmsSignerInfo)?;

    // Fail up front if any trusted certificate is unusable. A cert that can
    // never match is a configuration error, not a bad signature.
    let mut keys = Vec::with_capacity(certs.len());
    for cert in certs {
        let algo = crypto::cert_signature_algorithm(cert)?;
        let key = crypto::VerifyKey::from_certificate(cert)?;
        keys.push((algo, key));
    }

    let mut sha1_context = keys
        .iter()
        .any(|(a, _)| *a == SignatureAlgorithm::Sha1WithRsa)
        .then(|| Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY));
    let mut sha256_context = keys
        .iter()
        .any(|(a, _)| *a != SignatureAlgorithm::Sha1WithRsa)
        .then(|| Context::new(&ring::digest::SHA256));

    reader.seek(SeekFrom::Start(0))?;
    stream::copy_n_inspect(
        &mut reader,
        io::sink(),
        info.signed_len,
        |data| {
            if let Some(context) = &mut sha1_context {
                context.update(data);
            }
            if let Some(context) = &mut sha256_context {
                context.update(data);
            }
        },
        cancel_signal,
    )?;

    let sha1_digest = sha1_context.map(|c| c.finish());
    let sha256_digest = sha256_context.map(|c| c.finish());

    for (index, (algo, key)) in keys.iter().enumerate() {
        let digest = match algo {
            SignatureAlgorithm::Sha1WithRsa => &sha1_digest,
            SignatureAlgorithm::Sha256WithRsa | SignatureAlgorithm::EcdsaWithSha256 => {
                &sha256_digest
            }
        };
        let Some(digest) = digest else {
            unreachable!("Digest was computed for every candidate algorithm");
        };

        match key.verify_sig(*algo, digest.as_ref(), signature) {
            Ok(()) => {
                debug!("Package signature matches certificate #{index}");
                return Ok(index);
            }
            Err(e) => {
                debug!("Certificate #{index} does not match package signature: {e}");
            }
        }
    }

    Err(Error::NoMatchingCertificate(certs.len()))
}

/// Compute the digital signature for the specified digest, formatted as a zip
/// file archive comment. The returned buffer includes both the 2-byte comment
/// size field and the comment itself. It should be written in place of the
/// original comment size field.
fn signature_comment(
    key: &RsaPrivateKey,
    cert: &Certificate,
    digest: ring::digest::Digest,
) -> Result<Vec<u8>> {
    let cms_signature = crypto::cms_sign_external(key, cert, digest.as_ref())?;
    let cms_signature_der = cms_signature.to_der()?;

    // Includes placeholder for the EOCD comment size field.
    let mut buf = vec![0; 2];

    // NULL-terminated readable message and actual signature.
    buf.extend(COMMENT_MESSAGE);
    buf.extend(&cms_signature_der);

    let full_size = buf.len() - 2 + usize::from(FOOTER_SIZE);
    let comment_size =
        u16::try_from(full_size).map_err(|_| Error::CommentTooLarge(full_size))?;
    let signature_start = u16::try_from(cms_signature_der.len() + usize::from(FOOTER_SIZE))
        .map_err(|_| Error::CommentTooLarge(full_size))?;

    // 6-byte footer: signature offset from the end, magic value, comment size.
    buf.extend(signature_start.to_le_bytes());
    buf.extend(b"\xff\xff");
    buf.extend(comment_size.to_le_bytes());

    if memmem::find(&buf[2..], ZIP_EOCD_MAGIC).is_some() {
        return Err(Error::EocdMagicInComment);
    }

    buf[..2].copy_from_slice(&comment_size.to_le_bytes());

    Ok(buf)
}

/// Sign a package, producing a copy with the whole-file signature stored in
/// the zip archive comment. The input must be a plain zip with a non-zip64
/// EOCD and no existing archive comment.
pub fn sign_package(
    mut reader: impl Read + Seek,
    mut writer: impl Write,
    key: &RsaPrivateKey,
    cert: &Certificate,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    if !crypto::cert_matches_key(cert, key)? {
        return Err(Error::KeyMismatch);
    }

    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < u64::from(EOCD_SIZE_NO_COMMENT) {
        return Err(Error::PackageTooSmall);
    }

    reader.seek(SeekFrom::Current(-i64::from(EOCD_SIZE_NO_COMMENT)))?;
    let mut eocd = [0u8; 22];
    reader.read_exact(&mut eocd)?;

    if &eocd[..4] != ZIP_EOCD_MAGIC {
        return Err(Error::EocdMagicNotFound);
    } else if eocd[20..22] != [0, 0] {
        return Err(Error::InputHasComment);
    }

    // Everything besides the comment size field and the comment itself is
    // covered by the signature.
    reader.seek(SeekFrom::Start(0))?;
    let mut context = Context::new(&ring::digest::SHA256);
    stream::copy_n_inspect(
        &mut reader,
        &mut writer,
        file_size - 2,
        |data| context.update(data),
        cancel_signal,
    )?;
    let digest = context.finish();

    let size_and_comment = signature_comment(key, cert, digest)?;
    writer.write_all(&size_and_comment)?;

    Ok(())
}

/// Read a whole entry out of a package. Intended for small entries, like
/// transfer lists and patch streams; large entries should be streamed from
/// the zip reader directly.
pub fn read_zip_entry(reader: impl Read + Seek, name: &str) -> Result<Vec<u8>> {
    let mut zip = ZipArchive::new(reader)?;
    let mut entry = zip.by_name(name).map_err(|e| match e {
        ZipError::FileNotFound => Error::MissingEntry(name.to_owned()),
        e => Error::Zip(e),
    })?;

    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;

    Ok(buf)
}
