use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::{Error, Result};

const SIGNING_KEY_FILE: &str = "ca-signing-key.pem";

/// Leaf certificate on disk, usable to terminate TLS as `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub host: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Produces leaf certificates for intercepted hosts.
///
/// Implementations block; callers run them off the async workers.
#[cfg_attr(test, mockall::automock)]
pub trait CertificateIssuer: Send + Sync {
    fn issue(&self, host: &str) -> Result<LeafCertificate>;
}

pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
    signing_key: PKey<Private>,
    signing_key_path: PathBuf,
    cert_dir: PathBuf,
    // serializes generation so concurrent tunnels to one host write the file once
    lock: Mutex<()>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_dir", &self.cert_dir)
            .field("signing_key_path", &self.signing_key_path)
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the operator CA.
    ///
    /// Leaf certificates all share one signing key. When `signing_key_file`
    /// is missing it is generated and persisted so later runs reuse it.
    pub fn load<P: AsRef<Path>>(
        ca_cert_file: P,
        ca_key_file: P,
        signing_key_file: Option<P>,
        cert_dir: P,
    ) -> Result<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cert_dir)?;

        let cert = X509::from_pem(&read_file(ca_cert_file.as_ref())?)?;
        let key = PKey::private_key_from_pem(&read_file(ca_key_file.as_ref())?)?;

        let signing_key_path = signing_key_file
            .map(|path| path.as_ref().to_path_buf())
            .unwrap_or_else(|| cert_dir.join(SIGNING_KEY_FILE));
        let signing_key = if signing_key_path.exists() {
            PKey::private_key_from_pem(&read_file(&signing_key_path)?)?
        } else {
            debug!("Generating signing key {}", signing_key_path.display());
            let key = PKey::from_rsa(Rsa::generate(2048)?)?;
            fs::write(&signing_key_path, key.private_key_to_pem_pkcs8()?)?;
            key
        };

        Ok(Self {
            cert,
            key,
            signing_key,
            signing_key_path,
            cert_dir,
            lock: Mutex::new(()),
        })
    }

    /// Build the authority from the interception settings, if all are present.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let (Some(ca_cert), Some(ca_key), Some(cert_dir)) = (
            config.ca_cert_file(),
            config.ca_key_file(),
            config.ca_cert_dir(),
        ) else {
            return Ok(None);
        };
        Self::load(ca_cert, ca_key, config.ca_signing_key_file(), cert_dir).map(Some)
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn ca_cert_pem(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_pem()?)
    }

    pub fn cert_path_for_host(&self, host: &str) -> PathBuf {
        let name: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.cert_dir.join(format!("{}.pem", name))
    }

    fn generate_host_cert(&self, host: &str) -> Result<X509> {
        let mut cert_builder = X509Builder::new()?;
        cert_builder.set_version(2)?;

        let serial_number = {
            let mut serial = BigNum::new()?;
            serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
            serial.to_asn1_integer()?
        };
        cert_builder.set_serial_number(&serial_number)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(365)?;
        cert_builder.set_not_before(&not_before)?;
        cert_builder.set_not_after(&not_after)?;

        let mut name_builder = X509NameBuilder::new()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, host)?;
        let subject_name = name_builder.build();
        cert_builder.set_subject_name(&subject_name)?;
        cert_builder.set_issuer_name(self.cert.subject_name())?;
        cert_builder.set_pubkey(&self.signing_key)?;

        cert_builder.append_extension(BasicConstraints::new().build()?)?;
        cert_builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        cert_builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let subject_key_identifier = SubjectKeyIdentifier::new()
            .build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(subject_key_identifier)?;

        let authority_key_identifier = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(authority_key_identifier)?;

        let mut san_builder = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            san_builder.ip(host);
        } else {
            san_builder.dns(host);
        }
        let san = san_builder.build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(san)?;

        cert_builder.sign(&self.key, MessageDigest::sha256())?;
        Ok(cert_builder.build())
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn issue(&self, host: &str) -> Result<LeafCertificate> {
        if host.is_empty() {
            return Err(Error::certificate("cannot issue a certificate without a host"));
        }
        let cert_path = self.cert_path_for_host(host);

        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::certificate("certificate lock poisoned"))?;

        if !cert_path.is_file() {
            debug!("Generating certificate {}", cert_path.display());
            let cert = self.generate_host_cert(host)?;
            // write then rename so a crashed write never leaves a truncated file
            let partial = cert_path.with_extension("pem.tmp");
            fs::write(&partial, cert.to_pem()?)?;
            fs::rename(&partial, &cert_path)?;
        }

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_path,
            key_path: self.signing_key_path.clone(),
        })
    }
}

/// Write a fresh self-signed CA certificate and key as PEM files.
pub fn generate_ca<P: AsRef<Path>>(cert_path: P, key_path: P, common_name: &str) -> Result<()> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut cert_builder = X509Builder::new()?;
    cert_builder.set_version(2)?;

    let serial_number = {
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    cert_builder.set_serial_number(&serial_number)?;

    // 10 years
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365 * 10)?;
    cert_builder.set_not_before(&not_before)?;
    cert_builder.set_not_after(&not_after)?;

    let mut name_builder = X509NameBuilder::new()?;
    name_builder.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, common_name)?;
    let name = name_builder.build();
    cert_builder.set_subject_name(&name)?;
    cert_builder.set_issuer_name(&name)?;
    cert_builder.set_pubkey(&key)?;

    cert_builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    cert_builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&cert_builder.x509v3_context(None, None))?;
    cert_builder.append_extension(subject_key_identifier)?;

    cert_builder.sign(&key, MessageDigest::sha256())?;

    fs::write(cert_path, cert_builder.build().to_pem()?)?;
    fs::write(key_path, key.private_key_to_pem_pkcs8()?)?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|err| Error::certificate(format!("{}: {}", path.display(), err)))
}
