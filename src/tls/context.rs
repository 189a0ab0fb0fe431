//! Process-wide trust material
//!
//! A [`TrustContext`] holds everything sessions share: the policy source,
//! the revocation store and the per-backend trust setup. It is read-only
//! once built. Backend material is created on the first session that needs
//! it.

use super::config::{Policy, PolicyMap, TlsError, TlsOption};
use super::crl::{check_revocation, RevocationStore};
use super::openssl_session;
use super::rustls_session::RustlsTrust;
use super::cert::PeerCertificate;
use super::verify::VerifyError;
use once_cell::sync::OnceCell;
use openssl::ssl::SslContext;
use std::sync::Arc;
use tracing::{debug, warn};

static GLOBAL: OnceCell<Arc<TrustContext>> = OnceCell::new();

/// Shared trust anchors, revocation store and policy
pub struct TrustContext {
    policy: Arc<dyn Policy>,
    revocation: Option<RevocationStore>,
    openssl: OnceCell<SslContext>,
    rustls: OnceCell<RustlsTrust>,
}

impl TrustContext {
    /// Build a context, loading revocation lists named by `policy`
    pub fn new(policy: Arc<dyn Policy>) -> Arc<Self> {
        let revocation = load_revocation_store(policy.as_ref());
        Self::with_revocation_store(policy, revocation)
    }

    /// Build a context around an already loaded revocation store
    pub fn with_revocation_store(
        policy: Arc<dyn Policy>,
        revocation: Option<RevocationStore>,
    ) -> Arc<Self> {
        Arc::new(TrustContext {
            policy,
            revocation,
            openssl: OnceCell::new(),
            rustls: OnceCell::new(),
        })
    }

    /// Install the process-wide context
    ///
    /// Only the first call builds anything; later calls return the existing
    /// context and drop their argument.
    pub fn initialize(policy: Arc<dyn Policy>) -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(policy)).clone()
    }

    /// Get the process-wide context, initializing it with an empty policy
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| Self::new(Arc::new(PolicyMap::new())))
            .clone()
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// The revocation store, if any CRL location is configured
    pub fn revocation(&self) -> Option<&RevocationStore> {
        self.revocation.as_ref()
    }

    /// Check a certificate against the revocation store
    pub fn check_revocation(&self, cert: &dyn PeerCertificate) -> Result<(), VerifyError> {
        check_revocation(self.revocation(), cert)
    }

    /// OpenSSL context shared by every OpenSSL session
    pub(crate) fn openssl_context(&self) -> Result<&SslContext, TlsError> {
        self.openssl
            .get_or_try_init(|| openssl_session::build_context(self.policy()))
    }

    /// rustls trust setup shared by every rustls session
    pub(crate) fn rustls_trust(&self) -> Result<&RustlsTrust, TlsError> {
        self.rustls.get_or_try_init(|| RustlsTrust::load(self.policy()))
    }
}

/// Load the revocation store named by the policy
///
/// Returns `None` when no location is configured. A configured location
/// that cannot be loaded is logged and leaves the store empty.
fn load_revocation_store(policy: &dyn Policy) -> Option<RevocationStore> {
    let file = policy.path(TlsOption::RevocationListFile, None);
    let dir = policy.path(TlsOption::RevocationListPath, None);
    if file.is_none() && dir.is_none() {
        return None;
    }

    let mut store = RevocationStore::new();
    if let Some(file) = file {
        match store.load_file(&file) {
            Ok(count) => debug!(path = %file.display(), count, "loaded CRL file"),
            Err(e) => warn!(path = %file.display(), "cannot load CRL file: {}", e),
        }
    }
    if let Some(dir) = dir {
        match store.load_dir(&dir) {
            Ok(count) => debug!(path = %dir.display(), count, "loaded CRL directory"),
            Err(e) => warn!(path = %dir.display(), "cannot load CRL directory: {}", e),
        }
    }
    Some(store)
}

#[cfg(test)]
mod tests {
    use super::super::cert::fixtures::*;
    use super::*;
    use std::fs;

    #[test]
    fn test_no_crl_location_means_no_store() {
        let trust = TrustContext::new(Arc::new(PolicyMap::new()));
        assert!(trust.revocation().is_none());
        assert!(trust.check_revocation(&cert(SERVER)).is_ok());
    }

    #[test]
    fn test_crl_file_and_dir_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ca.crl");
        fs::write(&file, CRL_REVOKED).unwrap();

        let policy = PolicyMap::new().set(TlsOption::RevocationListFile, file.to_string_lossy());
        let trust = TrustContext::new(Arc::new(policy));
        assert_eq!(trust.revocation().map(RevocationStore::len), Some(1));
        assert_eq!(
            trust.check_revocation(&cert(SERVER)),
            Err(VerifyError::CertificateRevoked)
        );

        let policy = PolicyMap::new().set(TlsOption::RevocationListPath, dir.path().to_string_lossy());
        let trust = TrustContext::new(Arc::new(policy));
        assert_eq!(trust.revocation().map(RevocationStore::len), Some(1));
    }

    #[test]
    fn test_unloadable_crl_location_gives_empty_store() {
        let policy = PolicyMap::new().set(TlsOption::RevocationListFile, "/nonexistent/fdtls.crl");
        let trust = TrustContext::new(Arc::new(policy));

        let store = trust.revocation().unwrap();
        assert!(store.is_empty());
        assert!(trust.check_revocation(&cert(SERVER)).is_ok());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let first = TrustContext::initialize(Arc::new(PolicyMap::new()));
        let second = TrustContext::initialize(Arc::new(
            PolicyMap::new().set(TlsOption::VerifyCertificate, "no"),
        ));

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &TrustContext::global()));
    }

    #[test]
    fn test_backend_material_built_once() {
        let policy = PolicyMap::new().set(TlsOption::TrustAnchorFile, "/nonexistent/ca.pem");
        let trust = TrustContext::new(Arc::new(policy));

        let a = trust.openssl_context().unwrap() as *const SslContext;
        let b = trust.openssl_context().unwrap() as *const SslContext;
        assert_eq!(a, b);

        let a = trust.rustls_trust().unwrap() as *const RustlsTrust;
        let b = trust.rustls_trust().unwrap() as *const RustlsTrust;
        assert_eq!(a, b);
    }
}
