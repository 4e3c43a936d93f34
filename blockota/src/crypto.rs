// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env::{self, VarError},
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use cms::{
    cert::{CertificateChoices, IssuerAndSerialNumber},
    content_info::{CmsVersion, ContentInfo},
    signed_data::{
        CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo, SignatureValue,
        SignedData, SignerIdentifier, SignerInfo, SignerInfos,
    },
};
use p256::ecdsa::{self, signature::hazmat::PrehashVerifier};
use pkcs8::{
    DecodePrivateKey, EncodePrivateKey, EncodePublicKey, EncryptedPrivateKeyInfo, LineEnding,
    PrivateKeyInfo,
    pkcs5::{pbes2, scrypt},
};
use rand::RngCore;
use rsa::{
    BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, pkcs1v15::SigningKey,
    traits::PublicKeyParts,
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{
        Any, Decode, DecodePem, EncodePem, asn1::ObjectIdentifier, pem::PemLabel,
        referenced::OwnedToRef,
    },
    serial_number::SerialNumber,
    spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned},
    time::Validity,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Refusing to sign with algorithm: {0:?}")]
    UnsupportedSignAlgorithm(SignatureAlgorithm),
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("RSA public exponent not supported: {0}")]
    UnsupportedExponent(String),
    #[error("EC keys must use the P-256 curve")]
    UnsupportedCurve,
    #[error("Key type does not match the signature algorithm")]
    KeyAlgorithmMismatch,
    #[error("Invalid digest length ({0} bytes) for {1:?}")]
    InvalidDigestLength(usize, SignatureAlgorithm),
    #[error("Passphrase required for encrypted key: {0:?}")]
    PassphraseRequired(PathBuf),
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load encrypted RSA private key")]
    LoadKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to load unencrypted RSA private key")]
    LoadKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to save encrypted RSA private key")]
    SaveKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to save unencrypted RSA private key")]
    SaveKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to load X509 certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to save X509 certificate")]
    SaveCert(#[source] x509_cert::der::Error),
    #[error("Failed to extract public key from certificate")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load EC public key")]
    EcdsaKey(#[source] ecdsa::signature::Error),
    #[error("Failed to ECDSA verify signature")]
    EcdsaVerify(#[source] ecdsa::signature::Error),
    #[error("Failed to generate RSA key")]
    RsaGenerate(#[source] Box<rsa::Error>),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to generate X509 certificate")]
    CertGenerate(#[source] x509_cert::builder::Error),
    #[error("Invalid parameters for X509 certificate generation")]
    CertParams(#[source] x509_cert::der::Error),
    #[error("Failed to CMS sign digest")]
    CmsSign(#[source] x509_cert::der::Error),
    #[error("Failed to parse CMS signature")]
    CmsParse(#[source] x509_cert::der::Error),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// How a package signature was produced. The algorithm is taken from the
/// certificate's own signature algorithm, which also selects the digest used
/// for the whole-file hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureAlgorithm {
    Sha1WithRsa,
    Sha256WithRsa,
    EcdsaWithSha256,
}

impl SignatureAlgorithm {
    /// Length of digest required by the signing algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1WithRsa => Sha1::output_size(),
            Self::Sha256WithRsa | Self::EcdsaWithSha256 => Sha256::output_size(),
        }
    }

    /// The streaming digest implementation for hashing large files.
    pub fn ring_algorithm(self) -> &'static ring::digest::Algorithm {
        match self {
            Self::Sha1WithRsa => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256WithRsa | Self::EcdsaWithSha256 => &ring::digest::SHA256,
        }
    }
}

/// The signature algorithm recorded in the certificate itself.
pub fn cert_signature_algorithm(cert: &Certificate) -> Result<SignatureAlgorithm> {
    let oid = cert.signature_algorithm.oid;

    if oid == const_oid::db::rfc5912::SHA_1_WITH_RSA_ENCRYPTION {
        Ok(SignatureAlgorithm::Sha1WithRsa)
    } else if oid == const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION {
        Ok(SignatureAlgorithm::Sha256WithRsa)
    } else if oid == const_oid::db::rfc5912::ECDSA_WITH_SHA_256 {
        Ok(SignatureAlgorithm::EcdsaWithSha256)
    } else {
        Err(Error::UnsupportedAlgorithm(oid.to_string()))
    }
}

#[derive(Clone)]
pub enum PassphraseSource {
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn acquire(&self) -> Result<String> {
        match self {
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e)),
            Self::File(p) => Ok(fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned()),
        }
    }
}

fn check_rsa_key(key: &RsaPublicKey) -> Result<()> {
    if key.size() != 2048 / 8 && key.size() != 4096 / 8 {
        return Err(Error::UnsupportedKeySize(key.size()));
    }

    let e = key.e();
    if *e != BigUint::from(3u32) && *e != BigUint::from(65537u32) {
        return Err(Error::UnsupportedExponent(e.to_string()));
    }

    Ok(())
}

/// A public key extracted from a certificate, constrained to what package
/// signatures may use: 2048/4096-bit RSA with exponent 3 or 65537, or
/// ECDSA P-256.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyKey {
    Rsa(RsaPublicKey),
    Ec(ecdsa::VerifyingKey),
}

impl VerifyKey {
    pub fn from_certificate(cert: &Certificate) -> Result<Self> {
        let spki = &cert.tbs_certificate.subject_public_key_info;
        let oid = spki.algorithm.oid;

        if oid == const_oid::db::rfc5912::RSA_ENCRYPTION {
            let key = RsaPublicKey::try_from(spki.owned_to_ref()).map_err(Error::LoadPubKey)?;
            check_rsa_key(&key)?;

            Ok(Self::Rsa(key))
        } else if oid == const_oid::db::rfc5912::ID_EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok());
            if curve != Some(const_oid::db::rfc5912::SECP_256_R_1) {
                return Err(Error::UnsupportedCurve);
            }

            let key = ecdsa::VerifyingKey::from_sec1_bytes(spki.subject_public_key.raw_bytes())
                .map_err(Error::EcdsaKey)?;

            Ok(Self::Ec(key))
        } else {
            Err(Error::UnsupportedAlgorithm(oid.to_string()))
        }
    }

    /// Verify a raw signature against a precomputed digest.
    pub fn verify_sig(
        &self,
        algo: SignatureAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        match (self, algo) {
            (
                Self::Rsa(key),
                SignatureAlgorithm::Sha1WithRsa | SignatureAlgorithm::Sha256WithRsa,
            ) => key.verify_sig(algo, digest, signature),
            (Self::Ec(key), SignatureAlgorithm::EcdsaWithSha256) => {
                if digest.len() != algo.digest_len() {
                    return Err(Error::InvalidDigestLength(digest.len(), algo));
                }

                let signature =
                    ecdsa::Signature::from_der(signature).map_err(Error::EcdsaVerify)?;
                key.verify_prehash(digest, &signature)
                    .map_err(Error::EcdsaVerify)
            }
            _ => Err(Error::KeyAlgorithmMismatch),
        }
    }
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify the signature against the specified key.
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_rsa_key(self)?;

        let scheme = match algo {
            SignatureAlgorithm::Sha1WithRsa => Pkcs1v15Sign::new::<Sha1>(),
            SignatureAlgorithm::Sha256WithRsa => Pkcs1v15Sign::new::<Sha256>(),
            SignatureAlgorithm::EcdsaWithSha256 => return Err(Error::KeyAlgorithmMismatch),
        };

        self.verify(scheme, digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

pub trait RsaPrivateKeyExt {
    fn sign_digest(&self, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>>;
}

impl RsaPrivateKeyExt for RsaPrivateKey {
    /// Sign the digest with the specified signature algorithm.
    fn sign_digest(&self, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_rsa_key(&self.to_public_key())?;

        let scheme = match algo {
            // We don't support signing with insecure algorithms, nor with EC
            // keys.
            SignatureAlgorithm::Sha1WithRsa | SignatureAlgorithm::EcdsaWithSha256 => {
                return Err(Error::UnsupportedSignAlgorithm(algo));
            }
            SignatureAlgorithm::Sha256WithRsa => Pkcs1v15Sign::new::<Sha256>(),
        };

        self.sign(scheme, digest)
            .map_err(|e| Error::RsaSign(Box::new(e)))
    }
}

/// Generate an RSA key pair of one of the sizes the verifier accepts (2048 or
/// 4096 bits).
pub fn generate_rsa_key_pair(bits: usize) -> Result<RsaPrivateKey> {
    if bits != 2048 && bits != 4096 {
        return Err(Error::UnsupportedKeySize(bits / 8));
    }

    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| Error::RsaGenerate(Box::new(e)))?;

    Ok(key)
}

/// Generate a self-signed certificate.
pub fn generate_cert(
    key: &RsaPrivateKey,
    serial: u64,
    validity: Duration,
    subject: &str,
) -> Result<Certificate> {
    let public_key_der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(Error::LoadPubKey)?;
    let signing_key = SigningKey::<Sha256>::new(key.clone());

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(serial),
        Validity::from_now(validity).map_err(Error::CertParams)?,
        subject.parse().map_err(Error::CertParams)?,
        SubjectPublicKeyInfoOwned::from_der(public_key_der.as_bytes())
            .map_err(Error::CertParams)?,
        &signing_key,
    )
    .map_err(Error::CertGenerate)?;

    let mut rng = rand::thread_rng();
    let cert = builder
        .build_with_rng(&mut rng)
        .map_err(Error::CertGenerate)?;

    Ok(cert)
}

/// The PEM decoder follows rfc7468 strictly and rejects base64 lines longer
/// than 64 characters. Certificates in the wild are sometimes formatted with
/// longer lines, so reflow the base64 section before parsing.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for mut line in data.split(|&c| c == b'\n') {
        while !line.is_empty() && line[line.len() - 1].is_ascii_whitespace() {
            line = &line[..line.len() - 1];
        }

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN CERTIFICATE-----") {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(b"-----END CERTIFICATE-----") {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            base64.clear();

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if inside_base64 {
            base64.extend_from_slice(line);
            continue;
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

/// Read PEM-encoded certificate from a reader.
pub fn read_pem_cert(path: &Path, mut reader: impl Read) -> Result<Certificate> {
    let mut data = vec![];
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let data = reformat_pem(&data)?;
    let certificate = Certificate::from_pem(data).map_err(Error::LoadCert)?;

    Ok(certificate)
}

/// Write PEM-encoded certificate to a writer.
pub fn write_pem_cert(path: &Path, mut writer: impl Write, cert: &Certificate) -> Result<()> {
    let data = cert.to_pem(LineEnding::LF).map_err(Error::SaveCert)?;

    writer
        .write_all(data.as_bytes())
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    Ok(())
}

/// Read PEM-encoded certificate from a file.
pub fn read_pem_cert_file(path: &Path) -> Result<Certificate> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_cert(path, reader)
}

/// Write PEM-encoded certificate to a file.
pub fn write_pem_cert_file(path: &Path, cert: &Certificate) -> Result<()> {
    let writer = File::create(path).map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    write_pem_cert(path, writer, cert)
}

/// Read PEM-encoded PKCS8 private key from a reader. A passphrase source is
/// only required for encrypted keys.
pub fn read_pem_key(
    path: &Path,
    mut reader: impl Read,
    source: Option<&PassphraseSource>,
) -> Result<RsaPrivateKey> {
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    if data.contains("ENCRYPTED") {
        let Some(source) = source else {
            return Err(Error::PassphraseRequired(path.to_owned()));
        };
        let passphrase = source.acquire()?;

        RsaPrivateKey::from_pkcs8_encrypted_pem(&data, passphrase).map_err(Error::LoadKeyEncrypted)
    } else {
        RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadKeyUnencrypted)
    }
}

/// Write PEM-encoded PKCS8 private key to a writer, encrypting it if a
/// passphrase source is given and yields a non-empty passphrase.
pub fn write_pem_key(
    path: &Path,
    mut writer: impl Write,
    key: &RsaPrivateKey,
    source: Option<&PassphraseSource>,
) -> Result<()> {
    let passphrase = match source {
        Some(source) => source.acquire()?,
        None => String::new(),
    };

    let data = if passphrase.is_empty() {
        key.to_pkcs8_pem(LineEnding::LF)
            .map_err(Error::SaveKeyUnencrypted)?
    } else {
        let mut rng = rand::thread_rng();

        // pkcs8's default scrypt cost parameter is high enough that openssl
        // refuses to read the result with `memory limit exceeded`. Use
        // openssl's own pkcs8 defaults instead: N=16384, r=8, p=1 and
        // AES-256-CBC.
        //
        // https://github.com/RustCrypto/formats/issues/1205

        let mut salt = [0u8; 16];
        rng.fill_bytes(&mut salt);

        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut iv);

        // 14 = log_2(16384), 32 bytes = 256 bits
        let scrypt_params = scrypt::Params::new(14, 8, 1, 32).unwrap();
        let pbes2_params = pbes2::Parameters::scrypt_aes256cbc(scrypt_params, &salt, &iv).unwrap();

        let plain_text_der = key.to_pkcs8_der().map_err(Error::SaveKeyEncrypted)?;
        let private_key_info =
            PrivateKeyInfo::try_from(plain_text_der.as_bytes()).map_err(Error::SaveKeyEncrypted)?;

        let secret_doc = private_key_info
            .encrypt_with_params(pbes2_params, passphrase)
            .map_err(Error::SaveKeyEncrypted)?;

        secret_doc
            .to_pem(EncryptedPrivateKeyInfo::PEM_LABEL, LineEnding::LF)
            .map_err(pkcs8::Error::Asn1)
            .map_err(Error::SaveKeyEncrypted)?
    };

    writer
        .write_all(data.as_bytes())
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    Ok(())
}

/// Read PEM-encoded PKCS8 private key from a file.
pub fn read_pem_key_file(path: &Path, source: Option<&PassphraseSource>) -> Result<RsaPrivateKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_key(path, reader, source)
}

/// Save PEM-encoded PKCS8 private key to a file.
pub fn write_pem_key_file(
    path: &Path,
    key: &RsaPrivateKey,
    source: Option<&PassphraseSource>,
) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    options.create(true);
    options.truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let writer = options
        .open(path)
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    write_pem_key(path, writer, key, source)
}

/// Check if a certificate matches a private key.
pub fn cert_matches_key(cert: &Certificate, key: &RsaPrivateKey) -> Result<bool> {
    match VerifyKey::from_certificate(cert)? {
        VerifyKey::Rsa(public_key) => Ok(public_key == key.to_public_key()),
        VerifyKey::Ec(_) => Ok(false),
    }
}

/// Parse a CMS [`SignedData`] structure from raw DER-encoded data.
pub fn parse_cms(data: &[u8]) -> Result<SignedData> {
    let ci = ContentInfo::from_der(data).map_err(Error::CmsParse)?;
    let sd = ci
        .content
        .decode_as::<SignedData>()
        .map_err(Error::CmsParse)?;

    Ok(sd)
}

/// Get an iterator to all standard X509 certificates contained within a
/// [`SignedData`] structure.
pub fn iter_cms_certs(sd: &SignedData) -> impl Iterator<Item = &Certificate> {
    sd.certificates.iter().flat_map(|certs| {
        certs.0.iter().filter_map(|cc| {
            if let CertificateChoices::Certificate(c) = cc {
                Some(c)
            } else {
                None
            }
        })
    })
}

/// Raw signature bytes of the first signer in a [`SignedData`] structure.
pub fn cms_signature_bytes(sd: &SignedData) -> Option<&[u8]> {
    let signer = sd.signer_infos.0.iter().next()?;

    Some(signer.signature.as_bytes())
}

/// Create a CMS signature from an external digest. The package verifier is
/// not actually CMS compliant. It uses the CMS [`SignedData`] structure only
/// as a transport mechanism for a raw signature over the signed region, so
/// there must be no signed attributes for the signature to cover anything
/// else.
pub fn cms_sign_external(
    key: &RsaPrivateKey,
    cert: &Certificate,
    digest: &[u8],
) -> Result<ContentInfo> {
    let signature = key.sign_digest(SignatureAlgorithm::Sha256WithRsa, digest)?;

    let digest_algorithm = AlgorithmIdentifierOwned {
        oid: const_oid::db::rfc5912::ID_SHA_256,
        parameters: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: DigestAlgorithmIdentifiers::try_from(vec![digest_algorithm.clone()])
            .map_err(Error::CmsSign)?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: const_oid::db::rfc5911::ID_DATA,
            econtent: None,
        },
        certificates: Some(
            CertificateSet::try_from(vec![CertificateChoices::Certificate(cert.clone())])
                .map_err(Error::CmsSign)?,
        ),
        crls: None,
        signer_infos: SignerInfos::try_from(vec![SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: cert.tbs_certificate.issuer.clone(),
                serial_number: cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_algorithm,
            signed_attrs: None,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
                parameters: None,
            },
            signature: SignatureValue::new(signature).map_err(Error::CmsSign)?,
            unsigned_attrs: None,
        }])
        .map_err(Error::CmsSign)?,
    };

    let signed_data = ContentInfo {
        content_type: const_oid::db::rfc5911::ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).map_err(Error::CmsSign)?,
    };

    Ok(signed_data)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use x509_cert::{
        TbsCertificate,
        der::{Encode, asn1::BitString},
    };

    use super::*;

    fn test_key() -> RsaPrivateKey {
        generate_rsa_key_pair(2048).unwrap()
    }

    #[test]
    fn rsa_sign_and_verify() {
        let key = test_key();
        let digest = Sha256::digest(b"payload");

        let signature = key
            .sign_digest(SignatureAlgorithm::Sha256WithRsa, &digest)
            .unwrap();

        let public_key = key.to_public_key();
        public_key
            .verify_sig(SignatureAlgorithm::Sha256WithRsa, &digest, &signature)
            .unwrap();

        let mut bad_signature = signature.clone();
        bad_signature[0] ^= 1;
        assert_matches!(
            public_key.verify_sig(SignatureAlgorithm::Sha256WithRsa, &digest, &bad_signature),
            Err(Error::RsaVerify(_))
        );

        assert_matches!(
            key.sign_digest(SignatureAlgorithm::Sha1WithRsa, &Sha1::digest(b"payload")),
            Err(Error::UnsupportedSignAlgorithm(_))
        );
    }

    #[test]
    fn rsa_key_constraints() {
        let mut rng = rand::thread_rng();

        let small_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let digest = Sha256::digest(b"payload");
        assert_matches!(
            small_key.to_public_key().verify_sig(
                SignatureAlgorithm::Sha256WithRsa,
                &digest,
                &[0u8; 128],
            ),
            Err(Error::UnsupportedKeySize(128))
        );

        let odd_exp_key =
            RsaPrivateKey::new_with_exp(&mut rng, 2048, &BigUint::from(17u32)).unwrap();
        assert_matches!(
            odd_exp_key.to_public_key().verify_sig(
                SignatureAlgorithm::Sha256WithRsa,
                &digest,
                &[0u8; 256],
            ),
            Err(Error::UnsupportedExponent(_))
        );
    }

    #[test]
    fn cert_round_trip() {
        let key = test_key();
        let cert = generate_cert(&key, 42, Duration::from_secs(3600), "CN=test").unwrap();

        assert_eq!(
            cert_signature_algorithm(&cert).unwrap(),
            SignatureAlgorithm::Sha256WithRsa
        );
        assert!(cert_matches_key(&cert, &key).unwrap());
        assert_matches!(
            VerifyKey::from_certificate(&cert).unwrap(),
            VerifyKey::Rsa(_)
        );

        let mut pem = vec![];
        write_pem_cert(Path::new("-"), &mut pem, &cert).unwrap();
        let roundtripped = read_pem_cert(Path::new("-"), pem.as_slice()).unwrap();
        assert_eq!(roundtripped, cert);

        // Non-rfc7468 formatting with one long base64 line must still load.
        let text = String::from_utf8(pem).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        let (end, rest) = lines.split_last().unwrap();
        let (begin, base64) = rest.split_first().unwrap();
        let long_line = format!("{begin}\n{}\n{end}\n", base64.concat());
        let reloaded = read_pem_cert(Path::new("-"), long_line.as_bytes()).unwrap();
        assert_eq!(reloaded, cert);
    }

    #[test]
    fn key_pem_round_trip() {
        let key = test_key();

        let mut pem = vec![];
        write_pem_key(Path::new("-"), &mut pem, &key, None).unwrap();
        let loaded = read_pem_key(Path::new("-"), pem.as_slice(), None).unwrap();
        assert_eq!(loaded, key);

        let temp_dir = tempfile::tempdir().unwrap();
        let pass_path = temp_dir.path().join("pass.txt");
        fs::write(&pass_path, "hunter2\n").unwrap();
        let source = PassphraseSource::File(pass_path);

        let mut pem = vec![];
        write_pem_key(Path::new("-"), &mut pem, &key, Some(&source)).unwrap();

        assert_matches!(
            read_pem_key(Path::new("-"), pem.as_slice(), None),
            Err(Error::PassphraseRequired(_))
        );

        let loaded = read_pem_key(Path::new("-"), pem.as_slice(), Some(&source)).unwrap();
        assert_eq!(loaded, key);
    }

    #[test]
    fn cms_sign_and_extract() {
        let key = test_key();
        let cert = generate_cert(&key, 1, Duration::from_secs(3600), "CN=test").unwrap();
        let digest = Sha256::digest(b"signed region");

        let content_info = cms_sign_external(&key, &cert, &digest).unwrap();
        let der = content_info.to_der().unwrap();

        let sd = parse_cms(&der).unwrap();
        assert_eq!(iter_cms_certs(&sd).count(), 1);

        let signature = cms_signature_bytes(&sd).unwrap();
        key.to_public_key()
            .verify_sig(SignatureAlgorithm::Sha256WithRsa, &digest, signature)
            .unwrap();
    }

    #[test]
    fn ec_verify() {
        let mut rng = rand::thread_rng();
        let signing_key = p256::ecdsa::SigningKey::random(&mut rng);
        let digest = Sha256::digest(b"payload");

        let signature: p256::ecdsa::Signature = signing_key.sign_prehash(&digest).unwrap();
        let der = signature.to_der();

        let key = VerifyKey::Ec(*signing_key.verifying_key());
        key.verify_sig(SignatureAlgorithm::EcdsaWithSha256, &digest, der.as_bytes())
            .unwrap();

        let other_digest = Sha256::digest(b"other");
        assert_matches!(
            key.verify_sig(
                SignatureAlgorithm::EcdsaWithSha256,
                &other_digest,
                der.as_bytes(),
            ),
            Err(Error::EcdsaVerify(_))
        );

        assert_matches!(
            key.verify_sig(SignatureAlgorithm::Sha256WithRsa, &digest, der.as_bytes()),
            Err(Error::KeyAlgorithmMismatch)
        );
    }

    #[test]
    fn ec_cert_classification() {
        let mut rng = rand::thread_rng();
        let signing_key = p256::ecdsa::SigningKey::random(&mut rng);
        let spki_der = signing_key
            .verifying_key()
            .to_public_key_der()
            .unwrap();

        let tbs_certificate = TbsCertificate {
            version: x509_cert::certificate::Version::V3,
            serial_number: SerialNumber::from(1u64),
            signature: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ECDSA_WITH_SHA_256,
                parameters: None,
            },
            issuer: "CN=test".parse().unwrap(),
            validity: Validity::from_now(Duration::from_secs(3600)).unwrap(),
            subject: "CN=test".parse().unwrap(),
            subject_public_key_info: SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())
                .unwrap(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };

        let cert = Certificate {
            tbs_certificate,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ECDSA_WITH_SHA_256,
                parameters: None,
            },
            signature: BitString::from_bytes(&[]).unwrap(),
        };

        assert_eq!(
            cert_signature_algorithm(&cert).unwrap(),
            SignatureAlgorithm::EcdsaWithSha256
        );
        assert_matches!(VerifyKey::from_certificate(&cert).unwrap(), VerifyKey::Ec(_));
        assert!(!cert_matches_key(&cert, &test_key()).unwrap());
    }
}
