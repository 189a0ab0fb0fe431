//! Certificate handling
//!
//! This module provides the view of an X.509 certificate that the verifier
//! and the revocation checker work with, and its implementation for
//! OpenSSL certificates. Both backends hand their peer chain to the
//! verifier through this view.

use super::config::{Policy, TlsError, TlsOption};
use openssl::hash::MessageDigest;
use openssl::x509::{X509, X509NameRef, X509Ref};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// X.509 distinguished name
///
/// Equality and hashing use a canonical form of the name, so two encodings
/// of the same name (a PrintableString and a UTF8String value, differing
/// case or spacing) compare equal the way OpenSSL's store lookups do. The
/// DER encoding and the one-line form are kept for diagnostics.
#[derive(Debug, Clone)]
pub struct DistinguishedName {
    canonical: Vec<u8>,
    der: Vec<u8>,
    display: String,
}

impl DistinguishedName {
    /// Build a name from an opaque encoding and display form
    ///
    /// The encoding is compared byte for byte.
    pub fn from_der(der: Vec<u8>, display: impl Into<String>) -> Self {
        DistinguishedName {
            canonical: der.clone(),
            der,
            display: display.into(),
        }
    }

    /// Build a name from an OpenSSL name
    pub fn from_x509_name(name: &X509NameRef) -> Self {
        DistinguishedName {
            canonical: canonical_form(name),
            der: name.to_der().unwrap_or_default(),
            display: oneline(name),
        }
    }

    /// DER encoding; empty if the name could not be encoded
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// One-line form, e.g. `/O=Example/CN=example.com`
    pub fn as_str(&self) -> &str {
        &self.display
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DistinguishedName {}

impl Hash for DistinguishedName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// Canonical encoding of a name
///
/// Each entry contributes its attribute OID and its value converted to
/// UTF-8, lowercased, trimmed and with inner whitespace runs collapsed. A
/// value that does not convert contributes its raw bytes. Entries are
/// length-prefixed so that no two distinct names share an encoding.
fn canonical_form(name: &X509NameRef) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in name.entries() {
        let oid = entry.object().to_string();
        let value = match entry.data().as_utf8() {
            Ok(text) => canonical_value(&text).into_bytes(),
            Err(_) => entry.data().as_slice().to_vec(),
        };
        for part in [oid.as_bytes(), value.as_slice()] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
    }
    out
}

fn canonical_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Format a name as `/SN=value/SN=value`
fn oneline(name: &X509NameRef) -> String {
    let mut line = String::new();
    for entry in name.entries() {
        let key = entry.object().nid().short_name().unwrap_or("?");
        let value = entry
            .data()
            .as_utf8()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "<undef>".to_string());
        line.push('/');
        line.push_str(key);
        line.push('=');
        line.push_str(&value);
    }
    if line.is_empty() {
        line.push('/');
    }
    line
}

/// Certificate serial number (big-endian magnitude)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    /// Build from big-endian bytes; leading zero bytes are ignored
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        SerialNumber(bytes[start..].to_vec())
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_bytes(&value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn as_u64(&self) -> Option<u64> {
        if self.0.len() > 8 {
            return None;
        }
        Some(self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u64() {
            Some(value) => write!(f, "{} (0x{:X})", value, value),
            None => {
                f.write_str("0x")?;
                for byte in &self.0 {
                    write!(f, "{:02X}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// What the verifier needs to know about one certificate
pub trait PeerCertificate {
    fn subject(&self) -> DistinguishedName;

    fn issuer(&self) -> DistinguishedName;

    fn serial(&self) -> SerialNumber;

    /// DER-encoded SubjectPublicKeyInfo, if the key can be extracted
    fn public_key_der(&self) -> Option<Vec<u8>>;

    /// Stable identity used to spot repeated callbacks for one certificate
    fn fingerprint(&self) -> Vec<u8>;
}

impl PeerCertificate for X509Ref {
    fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(self.subject_name())
    }

    fn issuer(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(self.issuer_name())
    }

    fn serial(&self) -> SerialNumber {
        self.serial_number()
            .to_bn()
            .map(|bn| SerialNumber::from_bytes(&bn.to_vec()))
            .unwrap_or_else(|_| SerialNumber::from_bytes(&[]))
    }

    fn public_key_der(&self) -> Option<Vec<u8>> {
        self.public_key().ok()?.public_key_to_der().ok()
    }

    fn fingerprint(&self) -> Vec<u8> {
        self.digest(MessageDigest::sha256())
            .map(|digest| digest.to_vec())
            .unwrap_or_else(|_| self.to_der().unwrap_or_default())
    }
}

impl PeerCertificate for X509 {
    fn subject(&self) -> DistinguishedName {
        PeerCertificate::subject(&**self)
    }

    fn issuer(&self) -> DistinguishedName {
        PeerCertificate::issuer(&**self)
    }

    fn serial(&self) -> SerialNumber {
        PeerCertificate::serial(&**self)
    }

    fn public_key_der(&self) -> Option<Vec<u8>> {
        PeerCertificate::public_key_der(&**self)
    }

    // X509Ref has an inherent `fingerprint(MessageDigest)`
    fn fingerprint(&self) -> Vec<u8> {
        PeerCertificate::fingerprint(&**self)
    }
}

/// Client certificate and key material, as PEM
pub(crate) struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl ClientIdentity {
    /// Read the client certificate configured for `host`
    ///
    /// The key is read from the certificate file when no key file is set.
    pub fn load(policy: &dyn Policy, host: &str) -> Result<Option<Self>, TlsError> {
        let Some(cert_path) = policy.path(TlsOption::ClientCertFile, Some(host)) else {
            return Ok(None);
        };
        let key_path = policy
            .path(TlsOption::ClientKeyFile, Some(host))
            .unwrap_or_else(|| cert_path.clone());

        let read = |path: &Path| {
            fs::read(path).map_err(|e| {
                TlsError::Certificate(format!("cannot read {}: {}", path.display(), e))
            })
        };

        Ok(Some(ClientIdentity {
            cert_pem: read(&cert_path)?,
            key_pem: read(&key_path)?,
        }))
    }
}
