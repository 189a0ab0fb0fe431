//! Certificate revocation list checking
//!
//! The libraries only hand us one certificate at a time while they walk a
//! chain, and a CRL's signature can only be trusted once the key of the CA
//! that signed it has itself been validated. The check therefore takes two
//! steps per certificate:
//!
//! 1. A CRL found under the certificate's *subject* is this CA's own list.
//!    Its signature is checked now, with the key just validated, together
//!    with its `nextUpdate` field.
//! 2. A CRL found under the certificate's *issuer* was signature-checked one
//!    step earlier, when the issuer itself was examined. Only its revoked
//!    serial numbers are scanned.
//!
//! This also lets a CA revoke its own certificate.

use super::cert::{DistinguishedName, PeerCertificate, SerialNumber};
use super::config::TlsError;
use super::verify::VerifyError;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::pkey::PKey;
use openssl::x509::X509Crl;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// A loaded CRL
pub trait RevocationList: Send + Sync {
    /// Name of the CA that issued this list
    fn issuer(&self) -> DistinguishedName;

    /// `lastUpdate` as Unix seconds
    fn last_update(&self) -> Option<i64>;

    /// `nextUpdate` as Unix seconds; `None` if absent or malformed
    fn next_update(&self) -> Option<i64>;

    /// Check the list's signature against a DER SubjectPublicKeyInfo
    fn is_signed_by(&self, public_key_der: &[u8]) -> bool;

    /// Check whether `serial` is listed as revoked
    fn revokes(&self, serial: &SerialNumber) -> bool;
}

/// CRL parsed by OpenSSL
pub struct OpensslCrl {
    crl: X509Crl,
}

impl OpensslCrl {
    pub fn new(crl: X509Crl) -> Self {
        OpensslCrl { crl }
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        Ok(Self::new(X509Crl::from_pem(pem)?))
    }

    pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
        Ok(Self::new(X509Crl::from_der(der)?))
    }
}

/// Convert an ASN.1 time to Unix seconds
fn unix_seconds(time: &Asn1TimeRef) -> Option<i64> {
    let epoch = Asn1Time::from_unix(0).ok()?;
    let diff = epoch.diff(time).ok()?;
    Some(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

impl RevocationList for OpensslCrl {
    fn issuer(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(self.crl.issuer_name())
    }

    fn last_update(&self) -> Option<i64> {
        unix_seconds(self.crl.last_update())
    }

    fn next_update(&self) -> Option<i64> {
        self.crl.next_update().and_then(unix_seconds)
    }

    fn is_signed_by(&self, public_key_der: &[u8]) -> bool {
        match PKey::public_key_from_der(public_key_der) {
            Ok(key) => self.crl.verify(&key).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn revokes(&self, serial: &SerialNumber) -> bool {
        let Some(revoked) = self.crl.get_revoked() else {
            return false;
        };
        revoked.iter().any(|entry| {
            entry
                .serial_number()
                .to_bn()
                .map(|bn| SerialNumber::from_bytes(&bn.to_vec()) == *serial)
                .unwrap_or(false)
        })
    }
}

/// Process-wide CRL collection, keyed by issuer name
#[derive(Default)]
pub struct RevocationStore {
    lists: HashMap<DistinguishedName, Box<dyn RevocationList>>,
}

impl RevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Add a CRL
    ///
    /// A store holds at most one list per issuer; a second list for the
    /// same issuer replaces the first only if it was issued later.
    pub fn insert(&mut self, list: Box<dyn RevocationList>) {
        let issuer = list.issuer();
        if let Some(existing) = self.lists.get(&issuer) {
            if list.last_update() <= existing.last_update() {
                debug!(issuer = %issuer, "keeping newer CRL already loaded");
                return;
            }
        }
        self.lists.insert(issuer, list);
    }

    /// Look up the CRL issued by `name`
    pub fn get(&self, name: &DistinguishedName) -> Option<&dyn RevocationList> {
        self.lists.get(name).map(|list| list.as_ref())
    }

    /// Load every CRL from a PEM file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, TlsError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut count = 0;
        for der in rustls_pemfile::crls(&mut reader) {
            let der = der?;
            self.insert(Box::new(OpensslCrl::from_der(der.as_ref())?));
            count += 1;
        }
        if count == 0 {
            return Err(TlsError::InvalidConfig(format!(
                "no CRL found in {}",
                path.display()
            )));
        }
        Ok(count)
    }

    /// Load every CRL file in a directory
    ///
    /// Files that hold no parsable CRL are skipped with a warning.
    pub fn load_dir(&mut self, path: &Path) -> Result<usize, TlsError> {
        let mut count = 0;
        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if !entry_path.is_file() {
                continue;
            }
            match self.load_file(&entry_path) {
                Ok(n) => count += n,
                Err(e) => warn!(path = %entry_path.display(), "skipping CRL file: {}", e),
            }
        }
        Ok(count)
    }

    /// Check a certificate against the store at the current time
    pub fn check(&self, cert: &dyn PeerCertificate) -> Result<(), VerifyError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.check_at(cert, now)
    }

    /// Check a certificate against the store at `now` (Unix seconds)
    pub fn check_at(&self, cert: &dyn PeerCertificate, now: i64) -> Result<(), VerifyError> {
        let subject = cert.subject();
        if let Some(crl) = self.get(&subject) {
            let signed = cert
                .public_key_der()
                .map(|key| crl.is_signed_by(&key))
                .unwrap_or(false);
            if !signed {
                error!(issuer = %subject, "invalid signature on CRL");
                return Err(VerifyError::CrlSignatureFailure);
            }

            match crl.next_update() {
                None => {
                    error!(issuer = %subject, "CRL has an invalid nextUpdate field");
                    return Err(VerifyError::CrlNextUpdateInvalid);
                }
                Some(next) if next <= now => {
                    error!(
                        issuer = %subject,
                        "CRL has expired; every certificate it covers is rejected until it is updated"
                    );
                    return Err(VerifyError::CrlHasExpired);
                }
                Some(_) => {}
            }
        }

        let issuer = cert.issuer();
        if let Some(crl) = self.get(&issuer) {
            let serial = cert.serial();
            if crl.revokes(&serial) {
                error!(
                    "certificate with serial {} revoked per CRL from issuer {}",
                    serial, issuer
                );
                return Err(VerifyError::CertificateRevoked);
            }
        }

        Ok(())
    }
}

/// Check a certificate against an optional store
///
/// Without a store there is nothing to enforce and every certificate passes.
pub fn check_revocation(
    store: Option<&RevocationStore>,
    cert: &dyn PeerCertificate,
) -> Result<(), VerifyError> {
    match store {
        Some(store) => store.check(cert),
        None => Ok(()),
    }
}
