//! rustls-backed sessions
//!
//! The `ClientConnection` is pumped by hand over the borrowed descriptor.
//! It is created on the first handshake step, after any resumption state
//! has been placed in the session's private ticket cache, because rustls
//! builds its ClientHello as soon as the connection exists.
//!
//! rustls classifies its own errors: every `rustls::Error` is fatal. Only
//! I/O errors below it go through the transient/temporary rule.

use super::cert::{ClientIdentity, PeerCertificate};
use super::config::{Policy, TlsError, TlsOption};
use super::context::TrustContext;
use super::fdio::FdIo;
use super::handshake::{classify_io, Direction, HandshakeResult, IoClass, Status};
use super::session::{token_mismatch, Backend, ResumptionToken, Role, SessionCore, TlsSession};
use super::verify::{lock, CertificateVerifier, ChainLink, SharedVerifier, VerifyError};
use openssl::x509::X509;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{
    ClientSessionMemoryCache, ClientSessionStore, Resumption, Tls12ClientSessionValue,
    Tls13ClientSessionValue, WebPkiServerVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, HandshakeKind,
    NamedGroup, OtherError, RootCertStore, SignatureScheme,
};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const HANDSHAKE: &str = "rustls handshake";
const READ: &str = "rustls read";
const WRITE: &str = "rustls write";

/// Entries kept per session cache
///
/// rustls splits the size between per-server slots of up to eight TLS 1.3
/// tickets each; a size below 16 leaves no room to hold any ticket.
const TICKET_CACHE_SIZE: usize = 32;

/// Trust setup shared by all rustls sessions
pub(crate) struct RustlsTrust {
    provider: Arc<CryptoProvider>,
    webpki: Arc<WebPkiServerVerifier>,
    /// Configured anchors, for checking a CA's own CRL
    anchors: Arc<Vec<X509>>,
}

impl RustlsTrust {
    /// Load the configured trust anchors, or the bundled roots
    pub(crate) fn load(policy: &dyn Policy) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        let mut anchors = Vec::new();

        let sources = anchor_sources(policy);
        let configured = !sources.is_empty();
        for path in sources {
            match load_pem_certs(&path) {
                Ok(certs) => {
                    for der in certs {
                        if let Ok(cert) = X509::from_der(der.as_ref()) {
                            anchors.push(cert);
                        }
                        if let Err(e) = roots.add(der) {
                            debug!(path = %path.display(), "skipping trust anchor: {}", e);
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), "cannot load trust anchors: {}", e),
            }
        }

        if roots.is_empty() {
            if configured {
                warn!("no usable trust anchors configured, using bundled roots");
            }
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| TlsError::InvalidConfig(format!("cannot build certificate verifier: {}", e)))?;

        Ok(RustlsTrust {
            provider,
            webpki,
            anchors: Arc::new(anchors),
        })
    }
}

/// Files named by the trust anchor options
fn anchor_sources(policy: &dyn Policy) -> Vec<PathBuf> {
    let mut sources = Vec::new();
    if let Some(file) = policy.path(TlsOption::TrustAnchorFile, None) {
        sources.push(file);
    }
    if let Some(dir) = policy.path(TlsOption::TrustAnchorPath, None) {
        match fs::read_dir(&dir) {
            Ok(entries) => sources.extend(
                entries
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.is_file()),
            ),
            Err(e) => warn!(path = %dir.display(), "cannot read trust anchor directory: {}", e),
        }
    }
    sources
}

fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?)
}

fn parse_identity(
    identity: &ClientIdentity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let certs = rustls_pemfile::certs(&mut identity.cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no certificate found".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut identity.key_pem.as_slice())
        .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?
        .ok_or_else(|| TlsError::Certificate("no private key found".to_string()))?;

    Ok((certs, key))
}

/// Certificate verifier that feeds every chain element to the shared
/// [`CertificateVerifier`]
///
/// webpki validates the chain as a whole; its verdict is attributed to the
/// end-entity certificate. The chain is then walked from the root down so
/// that a CA's own CRL is signature-checked before its children are
/// scanned against it.
pub struct ChainVerifier {
    inner: Arc<WebPkiServerVerifier>,
    anchors: Arc<Vec<X509>>,
    verifier: SharedVerifier,
}

impl ChainVerifier {
    pub fn new(trust: &Arc<TrustContext>, hostname: &str) -> Result<Self, TlsError> {
        let material = trust.rustls_trust()?;
        Ok(ChainVerifier {
            inner: material.webpki.clone(),
            anchors: material.anchors.clone(),
            verifier: Arc::new(Mutex::new(CertificateVerifier::new(trust.clone(), hostname))),
        })
    }

    /// Presented chain, leaf first, extended by the matching configured
    /// anchor when the server did not send it
    fn chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<Vec<X509>, rustls::Error> {
        let mut chain = Vec::with_capacity(intermediates.len() + 2);
        for der in std::iter::once(end_entity).chain(intermediates) {
            let cert = X509::from_der(der.as_ref())
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
            chain.push(cert);
        }

        if let Some(top) = chain.last() {
            let issuer = PeerCertificate::issuer(top);
            if PeerCertificate::subject(top) != issuer {
                let anchor = self
                    .anchors
                    .iter()
                    .find(|a| PeerCertificate::subject(*a) == issuer);
                if let Some(anchor) = anchor {
                    chain.push(anchor.clone());
                }
            }
        }
        Ok(chain)
    }
}

impl fmt::Debug for ChainVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainVerifier")
            .field("anchors", &self.anchors.len())
            .finish_non_exhaustive()
    }
}

/// rustls error for a rejected certificate
fn rejection(library: &Result<ServerCertVerified, rustls::Error>, error: Option<VerifyError>) -> rustls::Error {
    match (library, error) {
        (Err(e), Some(VerifyError::Chain(_)) | None) => e.clone(),
        (_, Some(VerifyError::CertificateRevoked)) => {
            rustls::Error::InvalidCertificate(CertificateError::Revoked)
        }
        (_, Some(err)) => {
            rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(err))))
        }
        (Ok(_), None) => rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure),
    }
}

impl ServerCertVerifier for ChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let library =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        let chain = self.chain(end_entity, intermediates)?;

        // One call per handshake; a resumed config's verifier starts fresh
        let mut verifier = lock(&self.verifier);
        verifier.reset();
        for (depth, cert) in chain.iter().enumerate().rev() {
            let preverified = depth != 0 || library.is_ok();
            let library_error = match (&library, preverified) {
                (Err(e), false) => Some(VerifyError::Chain(e.to_string())),
                _ => None,
            };

            let verdict = verifier.verify(ChainLink {
                depth: depth as u32,
                cert,
                preverified,
                library_error,
            });
            if !verdict.accepted {
                return Err(rejection(&library, verdict.error));
            }
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Session state exported from a rustls session
///
/// rustls only resumes a session under the certificate verifier and client
/// credentials it was negotiated with, so the token carries the source
/// configuration along with the cached session values.
pub struct RustlsResumption {
    config: Arc<ClientConfig>,
    trust: Arc<TrustContext>,
    server_name: ServerName<'static>,
    kx_hint: Option<NamedGroup>,
    tls12: Option<Tls12ClientSessionValue>,
    tls13: Vec<Tls13ClientSessionValue>,
}

/// TLS session driven through rustls
pub struct RustlsSession<'fd> {
    core: SessionCore,
    io: FdIo<'fd>,
    trust: Arc<TrustContext>,
    config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
    cache: Arc<ClientSessionMemoryCache>,
    conn: Option<ClientConnection>,
}

impl<'fd> RustlsSession<'fd> {
    pub fn new(
        fd: BorrowedFd<'fd>,
        role: Role,
        hostname: &str,
        trust: Arc<TrustContext>,
    ) -> Result<Self, TlsError> {
        let provider = trust.rustls_trust()?.provider.clone();
        let chain = Arc::new(ChainVerifier::new(&trust, hostname)?);

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(chain);

        let mut config = match ClientIdentity::load(trust.policy(), hostname)? {
            Some(identity) => {
                let (certs, key) = parse_identity(&identity)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TlsError::Certificate(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        let cache = Arc::new(ClientSessionMemoryCache::new(TICKET_CACHE_SIZE));
        config.resumption = Resumption::store(cache.clone());

        let server_name = match role {
            Role::Client => Some(
                ServerName::try_from(hostname.to_string())
                    .map_err(|_| TlsError::InvalidHostname(hostname.to_string()))?,
            ),
            Role::Server => None,
        };

        Ok(RustlsSession {
            core: SessionCore::new(role, hostname),
            io: FdIo::new(fd),
            trust,
            config: Arc::new(config),
            server_name,
            cache,
            conn: None,
        })
    }

    fn connect(&self) -> Result<ClientConnection, TlsError> {
        let name = self
            .server_name
            .clone()
            .ok_or_else(|| TlsError::InvalidConfig("server sessions cannot connect".to_string()))?;
        Ok(ClientConnection::new(self.config.clone(), name)?)
    }
}

/// Map an I/O error below rustls to a status
fn io_status<T>(core: &mut SessionCore, operation: &str, err: io::Error, blocked: Direction) -> Status<T> {
    match classify_io(&err) {
        IoClass::Transient => core.wait(blocked),
        IoClass::Temporary => core.fail(operation, err, false),
        IoClass::Fatal => core.fail(operation, err, true),
    }
}

/// Send queued ciphertext
fn flush(conn: &mut ClientConnection, io: &mut FdIo<'_>) -> io::Result<()> {
    while conn.wants_write() {
        conn.write_tls(io)?;
    }
    Ok(())
}

fn pump_handshake(core: &mut SessionCore, conn: &mut ClientConnection, io: &mut FdIo<'_>) -> HandshakeResult {
    loop {
        if let Err(e) = flush(conn, io) {
            return io_status(core, HANDSHAKE, e, Direction::Output);
        }

        if !conn.is_handshaking() {
            core.mark_handshake_done();
            debug!(
                host = %core.hostname(),
                version = ?conn.protocol_version(),
                cipher = ?conn.negotiated_cipher_suite().map(|suite| suite.suite()),
                kind = ?conn.handshake_kind(),
                "handshake complete"
            );
            return Status::Done(());
        }

        match conn.read_tls(io) {
            Ok(0) => return core.fail(HANDSHAKE, "connection closed during handshake", true),
            Ok(_) => {
                if let Err(e) = conn.process_new_packets() {
                    // Best effort: let the peer see the alert
                    let _ = flush(conn, io);
                    return core.fail(HANDSHAKE, e, true);
                }
            }
            Err(e) => return io_status(core, HANDSHAKE, e, Direction::Input),
        }
    }
}

impl TlsSession for RustlsSession<'_> {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn backend(&self) -> Backend {
        Backend::Rustls
    }

    fn do_handshake(&mut self) -> HandshakeResult {
        if self.core.handshake_done() {
            return Status::Done(());
        }
        if self.core.role() == Role::Server {
            return Status::Retry;
        }

        if self.conn.is_none() {
            match self.connect() {
                Ok(conn) => self.conn = Some(conn),
                Err(e) => return self.core.fail(HANDSHAKE, e, true),
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            return Status::Error;
        };
        pump_handshake(&mut self.core, conn, &mut self.io)
    }

    fn encrypted_read(&mut self, buf: &mut [u8]) -> Status<usize> {
        if let Some(status) = self.do_handshake().unfinished() {
            return status;
        }
        if buf.is_empty() {
            return self.core.done(0);
        }
        let Some(conn) = self.conn.as_mut() else {
            return self.core.fail(READ, "no connection", true);
        };

        loop {
            if let Err(e) = flush(conn, &mut self.io) {
                if classify_io(&e) != IoClass::Transient {
                    return io_status(&mut self.core, READ, e, Direction::Output);
                }
            }

            match conn.reader().read(buf) {
                Ok(n) => return self.core.done(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return self.core.fail(READ, e, true),
            }

            match conn.read_tls(&mut self.io) {
                // EOF is reported by the reader on the next pass
                Ok(_) => {
                    if let Err(e) = conn.process_new_packets() {
                        let _ = flush(conn, &mut self.io);
                        return self.core.fail(READ, e, true);
                    }
                }
                Err(e) => return io_status(&mut self.core, READ, e, Direction::Input),
            }
        }
    }

    fn encrypted_write(&mut self, buf: &[u8]) -> Status<usize> {
        if let Some(status) = self.do_handshake().unfinished() {
            return status;
        }
        let Some(conn) = self.conn.as_mut() else {
            return self.core.fail(WRITE, "no connection", true);
        };

        // Accept nothing new until earlier records are out
        if let Err(e) = flush(conn, &mut self.io) {
            return io_status(&mut self.core, WRITE, e, Direction::Output);
        }

        let written = match conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return self.core.fail(WRITE, e, true),
        };

        match flush(conn, &mut self.io) {
            Ok(()) => self.core.done(written),
            Err(e) if classify_io(&e) == IoClass::Transient => self.core.done(written),
            Err(e) => io_status(&mut self.core, WRITE, e, Direction::Output),
        }
    }

    fn wants_input(&self) -> bool {
        self.core.direction() == Some(Direction::Input)
    }

    fn wants_output(&self) -> bool {
        self.core.direction() == Some(Direction::Output)
            || self.conn.as_ref().is_some_and(|conn| conn.wants_write())
    }

    fn export_session(&self) -> Result<ResumptionToken, TlsError> {
        if !self.core.handshake_done() {
            return Err(TlsError::SessionResumptionFailed(
                "source handshake has not completed".to_string(),
            ));
        }
        let Some(name) = &self.server_name else {
            return Err(TlsError::SessionResumptionFailed(
                "server sessions have no resumption state".to_string(),
            ));
        };

        // TLS 1.3 tickets are single-use, so they move to the token
        let tls13: Vec<_> = std::iter::from_fn(|| self.cache.take_tls13_ticket(name)).collect();
        let tls12 = self.cache.tls12_session(name);
        if tls13.is_empty() && tls12.is_none() {
            return Err(TlsError::SessionResumptionFailed(
                "peer has not issued a session ticket".to_string(),
            ));
        }

        Ok(ResumptionToken::Rustls(RustlsResumption {
            config: self.config.clone(),
            trust: self.trust.clone(),
            server_name: name.clone(),
            kx_hint: self.cache.kx_hint(name),
            tls12,
            tls13,
        }))
    }

    fn import_session(&mut self, token: ResumptionToken) -> Result<(), TlsError> {
        let resumption = match token {
            ResumptionToken::Rustls(resumption) => resumption,
            other => return Err(token_mismatch(&other, Backend::Rustls)),
        };
        if self.conn.is_some() {
            return Err(TlsError::SessionResumptionFailed(
                "handshake already started".to_string(),
            ));
        }
        let Some(name) = self.server_name.clone() else {
            return Err(TlsError::SessionResumptionFailed(
                "server sessions cannot resume".to_string(),
            ));
        };
        if !Arc::ptr_eq(&resumption.trust, &self.trust) {
            return Err(TlsError::SessionResumptionFailed(
                "session belongs to a different trust context".to_string(),
            ));
        }
        if resumption.server_name != name {
            return Err(TlsError::SessionResumptionFailed(format!(
                "session was negotiated with {}",
                resumption.server_name.to_str()
            )));
        }

        // Same verifier and credentials as the source, own ticket cache
        let mut config = (*resumption.config).clone();
        config.resumption = Resumption::store(self.cache.clone());
        self.config = Arc::new(config);

        if let Some(group) = resumption.kx_hint {
            self.cache.set_kx_hint(name.clone(), group);
        }
        if let Some(session) = resumption.tls12 {
            self.cache.set_tls12_session(name.clone(), session);
        }
        // Taken newest first; put back oldest first
        for ticket in resumption.tls13.into_iter().rev() {
            self.cache.insert_tls13_ticket(name.clone(), ticket);
        }
        Ok(())
    }

    fn session_resumed(&self) -> bool {
        self.conn
            .as_ref()
            .and_then(|conn| conn.handshake_kind())
            .is_some_and(|kind| kind == HandshakeKind::Resumed)
    }
}
