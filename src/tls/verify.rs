//! Certificate chain verification
//!
//! Backends call into [`CertificateVerifier::verify`] once per certificate
//! while they validate the peer's chain. The verifier adds CRL checking to
//! the library's own verdict and applies the per-host `verify-certificate`
//! policy: when verification is not enforced, failures are logged as
//! warnings and the certificate is accepted anyway.

use super::cert::PeerCertificate;
use super::context::TrustContext;
use super::crl::check_revocation;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Why a certificate was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Failure reported by the TLS library itself
    #[error("{0}")]
    Chain(String),

    #[error("CRL signature failure")]
    CrlSignatureFailure,

    #[error("format error in CRL's nextUpdate field")]
    CrlNextUpdateInvalid,

    #[error("CRL has expired")]
    CrlHasExpired,

    #[error("certificate revoked")]
    CertificateRevoked,
}

impl VerifyError {
    /// Whether this failure came from revocation checking
    pub fn is_revocation(&self) -> bool {
        !matches!(self, VerifyError::Chain(_))
    }
}

/// One certificate handed over by the backend
pub struct ChainLink<'a> {
    /// Chain depth (0 is the peer's own certificate)
    pub depth: u32,
    pub cert: &'a dyn PeerCertificate,
    /// The library's verdict for this certificate
    pub preverified: bool,
    /// The library's reason when `preverified` is false
    pub library_error: Option<VerifyError>,
}

/// Decision for one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the backend should continue with the chain
    pub accepted: bool,
    /// The failure found, even when policy accepted the certificate anyway
    pub error: Option<VerifyError>,
}

/// Per-handshake verification state
#[derive(Debug, Default)]
pub struct VerificationState {
    previous: Option<Vec<u8>>,
    depth: Option<u32>,
    examined: usize,
    failure: Option<VerifyError>,
}

impl VerificationState {
    /// Most recent verification failure in this handshake
    ///
    /// Kept even when warn-only policy accepted the certificate, so a later
    /// handshake failure can still name it.
    pub fn failure(&self) -> Option<&VerifyError> {
        self.failure.as_ref()
    }

    /// Depth of the last certificate examined
    pub fn depth(&self) -> Option<u32> {
        self.depth
    }

    /// Number of distinct certificates seen, ignoring repeated callbacks
    pub fn examined(&self) -> usize {
        self.examined
    }
}

/// Chain verifier bound to one session's target host
pub struct CertificateVerifier {
    trust: Arc<TrustContext>,
    hostname: String,
    state: VerificationState,
}

impl CertificateVerifier {
    pub fn new(trust: Arc<TrustContext>, hostname: impl Into<String>) -> Self {
        CertificateVerifier {
            trust,
            hostname: hostname.into(),
            state: VerificationState::default(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> &VerificationState {
        &self.state
    }

    /// Forget everything seen so far, before a new chain
    pub fn reset(&mut self) {
        self.state = VerificationState::default();
    }

    /// Decide on one certificate of the chain
    pub fn verify(&mut self, link: ChainLink<'_>) -> Verdict {
        let fingerprint = link.cert.fingerprint();

        if self.state.previous.as_ref() != Some(&fingerprint) {
            self.state.examined += 1;
            debug!(
                depth = link.depth,
                subject = %link.cert.subject(),
                issuer = %link.cert.issuer(),
                "examining certificate"
            );
        }

        let mut ok = link.preverified;
        let mut failure = if ok {
            None
        } else {
            Some(
                link.library_error
                    .unwrap_or_else(|| VerifyError::Chain("certificate verify failed".to_string())),
            )
        };

        if ok {
            if let Err(e) = check_revocation(self.trust.revocation(), link.cert) {
                ok = false;
                failure = Some(e);
            }
        }

        let enforce = self.trust.policy().verify_certificate(&self.hostname);

        if let Some(reason) = &failure {
            if enforce {
                error!(host = %self.hostname, depth = link.depth, "certificate verification: {}", reason);
            } else {
                warn!(host = %self.hostname, depth = link.depth, "certificate verification: {}", reason);
            }
            self.state.failure = Some(reason.clone());
        }

        self.state.previous = Some(fingerprint);
        self.state.depth = Some(link.depth);

        Verdict {
            accepted: ok || !enforce,
            error: failure,
        }
    }
}

/// Verifier shared between a session and its backend callback
pub type SharedVerifier = Arc<Mutex<CertificateVerifier>>;

/// Lock a shared verifier, recovering from a poisoned lock
pub(crate) fn lock(verifier: &SharedVerifier) -> MutexGuard<'_, CertificateVerifier> {
    verifier.lock().unwrap_or_else(PoisonError::into_inner)
}
