//! OpenSSL-backed sessions
//!
//! The `Ssl` object is kept aside until the first handshake step so that a
//! resumption token can still be installed on it; the `SslStream` over the
//! borrowed descriptor is created at that point.

use super::cert::ClientIdentity;
use super::config::{Policy, TlsError, TlsOption};
use super::context::TrustContext;
use super::fdio::FdIo;
use super::handshake::{classify_io, temporary_network_error, Direction, HandshakeResult, IoClass, Status};
use super::session::{token_mismatch, Backend, ResumptionToken, Role, SessionCore, TlsSession};
use super::verify::{lock, CertificateVerifier, ChainLink, SharedVerifier, VerifyError};
use openssl::pkey::PKey;
use openssl::ssl::{
    self, ErrorCode, Ssl, SslContext, SslContextBuilder, SslContextRef, SslFiletype, SslMethod,
    SslMode, SslOptions, SslSession, SslStream, SslVerifyMode,
};
use openssl::x509::store::X509Lookup;
use openssl::x509::{X509StoreContextRef, X509VerifyResult, X509};
use std::io;
use std::net::IpAddr;
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const CONNECT: &str = "SSL_connect";
const READ: &str = "SSL_read";
const WRITE: &str = "SSL_write";

/// Build the client context shared by all OpenSSL sessions
pub(crate) fn build_context(policy: &dyn Policy) -> Result<SslContext, TlsError> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
    builder.set_options(SslOptions::ALL);
    builder.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);
    builder.set_verify(SslVerifyMode::PEER);
    load_trust_anchors(&mut builder, policy);
    Ok(builder.build())
}

/// Load configured trust anchors, falling back to the system defaults
fn load_trust_anchors(builder: &mut SslContextBuilder, policy: &dyn Policy) {
    let file = policy.path(TlsOption::TrustAnchorFile, None);
    let dir = policy.path(TlsOption::TrustAnchorPath, None);
    let mut usable = file.is_some() || dir.is_some();

    if let Some(file) = &file {
        if let Err(e) = builder.set_ca_file(file) {
            warn!(path = %file.display(), "cannot load trust anchors: {}", e);
            usable = false;
        }
    }

    if let Some(dir) = &dir {
        let loaded = match dir.to_str() {
            Some(name) => builder
                .cert_store_mut()
                .add_lookup(X509Lookup::hash_dir())
                .and_then(|lookup| lookup.add_dir(name, SslFiletype::PEM))
                .map_err(|e| e.to_string()),
            None => Err("path is not valid UTF-8".to_string()),
        };
        if let Err(e) = loaded {
            warn!(path = %dir.display(), "cannot load trust anchor directory: {}", e);
            usable = false;
        }
    }

    if !usable {
        if let Err(e) = builder.set_default_verify_paths() {
            warn!("cannot load default trust anchors: {}", e);
        }
    }
}

/// Session state exported from an OpenSSL session
pub struct OpensslResumption {
    session: SslSession,
    context: SslContext,
}

enum SslState<'fd> {
    /// Handshake not started yet
    Pending(Ssl),
    Active(SslStream<FdIo<'fd>>),
    /// The stream could not be created
    Broken,
}

/// TLS session driven through OpenSSL
pub struct OpensslSession<'fd> {
    core: SessionCore,
    io: FdIo<'fd>,
    state: SslState<'fd>,
    context: SslContext,
    verifier: SharedVerifier,
}

impl<'fd> OpensslSession<'fd> {
    pub fn new(
        fd: BorrowedFd<'fd>,
        role: Role,
        hostname: &str,
        trust: Arc<TrustContext>,
    ) -> Result<Self, TlsError> {
        let context = trust.openssl_context()?.clone();
        let mut ssl = Ssl::new(&context)?;
        let verifier: SharedVerifier =
            Arc::new(Mutex::new(CertificateVerifier::new(trust.clone(), hostname)));

        if role == Role::Client {
            if !hostname.is_empty() {
                match hostname.parse::<IpAddr>() {
                    Ok(ip) => ssl.param_mut().set_ip(ip)?,
                    Err(_) => {
                        ssl.set_hostname(hostname)?;
                        ssl.param_mut().set_host(hostname)?;
                    }
                }
            }

            let callback = verifier.clone();
            ssl.set_verify_callback(SslVerifyMode::PEER, move |preverified, ctx| {
                verify_callback(&callback, preverified, ctx)
            });

            if let Some(identity) = ClientIdentity::load(trust.policy(), hostname)? {
                install_identity(&mut ssl, &identity)?;
            }
        }

        Ok(OpensslSession {
            core: SessionCore::new(role, hostname),
            io: FdIo::new(fd),
            state: SslState::Pending(ssl),
            context,
            verifier,
        })
    }

    fn stream(&mut self) -> Result<&mut SslStream<FdIo<'fd>>, String> {
        if matches!(self.state, SslState::Pending(_)) {
            if let SslState::Pending(ssl) = std::mem::replace(&mut self.state, SslState::Broken) {
                match SslStream::new(ssl, self.io) {
                    Ok(stream) => self.state = SslState::Active(stream),
                    Err(e) => return Err(e.to_string()),
                }
            }
        }
        match &mut self.state {
            SslState::Active(stream) => Ok(stream),
            _ => Err("session is unusable".to_string()),
        }
    }

    fn ssl(&self) -> Option<&ssl::SslRef> {
        match &self.state {
            SslState::Pending(ssl) => Some(ssl),
            SslState::Active(stream) => Some(stream.ssl()),
            SslState::Broken => None,
        }
    }

    /// Sort a failed call into retry or error
    fn classify<T>(&mut self, operation: &str, err: ssl::Error, blocked: Direction) -> Status<T> {
        let code = err.code();
        if code == ErrorCode::WANT_READ || wants_x509_lookup(code) {
            return self.core.wait(Direction::Input);
        }
        if code == ErrorCode::WANT_WRITE {
            return self.core.wait(Direction::Output);
        }
        if code == ErrorCode::SYSCALL {
            if let Some(io_err) = err.io_error() {
                if classify_io(io_err) == IoClass::Transient {
                    return self.core.wait(blocked);
                }
            }
        }

        let fatal = is_fatal(code, err.ssl_error().is_none(), err.io_error());
        let reason = self.reason(&err);
        self.core.fail(operation, reason, fatal)
    }

    /// Human-readable reason for a failed call
    fn reason(&self, err: &ssl::Error) -> String {
        let library = err
            .ssl_error()
            .and_then(|stack| stack.errors().first())
            .and_then(|e| e.reason());

        match library {
            Some("certificate verify failed") => lock(&self.verifier)
                .state()
                .failure()
                .map(|failure| failure.to_string())
                .unwrap_or_else(|| "certificate verify failed".to_string()),
            Some(reason) => reason.to_string(),
            None => match err.io_error() {
                Some(io_err) => io_err.to_string(),
                None if err.code() == ErrorCode::SYSCALL => "unexpected EOF".to_string(),
                None => "error".to_string(),
            },
        }
    }
}

/// The certificate lookup callback asked to be called again
///
/// The crate exposes no constant for this code.
fn wants_x509_lookup(code: ErrorCode) -> bool {
    code.as_raw() == openssl_sys::SSL_ERROR_WANT_X509_LOOKUP
}

/// Whether a failed OpenSSL call leaves the connection unusable
///
/// A plain syscall-layer failure is recoverable when nothing was queued on
/// the error stack or the OS error is a temporary network condition.
pub(crate) fn is_fatal(code: ErrorCode, stack_empty: bool, io_err: Option<&io::Error>) -> bool {
    if code != ErrorCode::SYSCALL {
        return true;
    }
    !(stack_empty || io_err.is_some_and(temporary_network_error))
}

/// Load a client certificate and its key into `ssl`
fn install_identity(ssl: &mut Ssl, identity: &ClientIdentity) -> Result<(), TlsError> {
    let cert = X509::from_pem(&identity.cert_pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
    let key = PKey::private_key_from_pem(&identity.key_pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;

    if !cert.public_key()?.public_eq(&key) {
        return Err(TlsError::Certificate(
            "private key does not match certificate".to_string(),
        ));
    }

    ssl.set_certificate(&cert)?;
    ssl.set_private_key(&key)?;
    Ok(())
}

/// OpenSSL code matching a revocation failure
fn revocation_code(err: &VerifyError) -> Option<X509VerifyResult> {
    let raw = match err {
        VerifyError::Chain(_) => return None,
        VerifyError::CrlSignatureFailure => openssl_sys::X509_V_ERR_CRL_SIGNATURE_FAILURE,
        VerifyError::CrlNextUpdateInvalid => openssl_sys::X509_V_ERR_ERROR_IN_CRL_NEXT_UPDATE_FIELD,
        VerifyError::CrlHasExpired => openssl_sys::X509_V_ERR_CRL_HAS_EXPIRED,
        VerifyError::CertificateRevoked => openssl_sys::X509_V_ERR_CERT_REVOKED,
    };
    // SAFETY: the value is one of OpenSSL's own verification codes
    Some(unsafe { X509VerifyResult::from_raw(raw) })
}

fn verify_callback(verifier: &SharedVerifier, preverified: bool, ctx: &mut X509StoreContextRef) -> bool {
    let depth = ctx.error_depth();
    let library_error = if preverified {
        None
    } else {
        Some(VerifyError::Chain(ctx.error().error_string().to_string()))
    };

    let Some(cert) = ctx.current_cert() else {
        return preverified;
    };
    let verdict = lock(verifier).verify(ChainLink {
        depth,
        cert,
        preverified,
        library_error,
    });

    if let Some(code) = verdict.error.as_ref().and_then(revocation_code) {
        ctx.set_error(code);
    }
    verdict.accepted
}

impl TlsSession for OpensslSession<'_> {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn backend(&self) -> Backend {
        Backend::OpenSsl
    }

    fn do_handshake(&mut self) -> HandshakeResult {
        if self.core.handshake_done() {
            return Status::Done(());
        }
        if self.core.role() == Role::Server {
            return Status::Retry;
        }

        let result = match self.stream() {
            Ok(stream) => stream.connect(),
            Err(reason) => return self.core.fail(CONNECT, reason, true),
        };

        match result {
            Ok(()) => {
                self.core.mark_handshake_done();
                if let Some(ssl) = self.ssl() {
                    debug!(
                        host = %self.core.hostname(),
                        version = ssl.version_str(),
                        cipher = ssl.current_cipher().map(|c| c.name()).unwrap_or("none"),
                        resumed = ssl.session_reused(),
                        "handshake complete"
                    );
                }
                Status::Done(())
            }
            Err(e) => self.classify(CONNECT, e, Direction::Input),
        }
    }

    fn encrypted_read(&mut self, buf: &mut [u8]) -> Status<usize> {
        if let Some(status) = self.do_handshake().unfinished() {
            return status;
        }
        if buf.is_empty() {
            return self.core.done(0);
        }

        let result = match self.stream() {
            Ok(stream) => stream.ssl_read(buf),
            Err(reason) => return self.core.fail(READ, reason, true),
        };

        match result {
            Ok(n) => self.core.done(n),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => self.core.done(0),
            Err(e) => self.classify(READ, e, Direction::Input),
        }
    }

    fn encrypted_write(&mut self, buf: &[u8]) -> Status<usize> {
        if let Some(status) = self.do_handshake().unfinished() {
            return status;
        }

        let result = match self.stream() {
            Ok(stream) => stream.ssl_write(buf),
            Err(reason) => return self.core.fail(WRITE, reason, true),
        };

        match result {
            Ok(n) => self.core.done(n),
            Err(e) => self.classify(WRITE, e, Direction::Output),
        }
    }

    fn wants_input(&self) -> bool {
        self.core.direction() == Some(Direction::Input)
    }

    fn wants_output(&self) -> bool {
        self.core.direction() == Some(Direction::Output)
    }

    fn export_session(&self) -> Result<ResumptionToken, TlsError> {
        if !self.core.handshake_done() {
            return Err(TlsError::SessionResumptionFailed(
                "source handshake has not completed".to_string(),
            ));
        }
        let session = self
            .ssl()
            .and_then(|ssl| ssl.session())
            .ok_or_else(|| TlsError::SessionResumptionFailed("no session negotiated".to_string()))?;

        // Round-trip through DER so the token owns an independent copy
        let der = session.to_der()?;
        Ok(ResumptionToken::OpenSsl(OpensslResumption {
            session: SslSession::from_der(&der)?,
            context: self.context.clone(),
        }))
    }

    fn import_session(&mut self, token: ResumptionToken) -> Result<(), TlsError> {
        let resumption = match token {
            ResumptionToken::OpenSsl(resumption) => resumption,
            other => return Err(token_mismatch(&other, Backend::OpenSsl)),
        };
        let SslState::Pending(ssl) = &mut self.state else {
            return Err(TlsError::SessionResumptionFailed(
                "handshake already started".to_string(),
            ));
        };

        if !std::ptr::eq::<SslContextRef>(&*resumption.context, ssl.ssl_context()) {
            return Err(TlsError::SessionResumptionFailed(
                "session belongs to a different trust context".to_string(),
            ));
        }

        // SAFETY: the session was negotiated under this session's SslContext
        unsafe { ssl.set_session(&resumption.session) }
            .map_err(|e| TlsError::SessionResumptionFailed(e.to_string()))
    }

    fn session_resumed(&self) -> bool {
        self.core.handshake_done() && self.ssl().is_some_and(|ssl| ssl.session_reused())
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::PolicyMap;
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsFd;

    #[test]
    fn test_syscall_without_queued_error_is_recoverable() {
        assert!(!is_fatal(ErrorCode::SYSCALL, true, None));

        let reset = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(!is_fatal(ErrorCode::SYSCALL, false, Some(&reset)));

        let bad_fd = io::Error::from_raw_os_error(libc::EBADF);
        assert!(is_fatal(ErrorCode::SYSCALL, false, Some(&bad_fd)));
        assert!(is_fatal(ErrorCode::SYSCALL, false, None));
    }

    #[test]
    fn test_x509_lookup_is_a_read_wait() {
        assert!(wants_x509_lookup(ErrorCode::from_raw(openssl_sys::SSL_ERROR_WANT_X509_LOOKUP)));
        assert!(!wants_x509_lookup(ErrorCode::WANT_READ));
        assert!(!wants_x509_lookup(ErrorCode::SYSCALL));
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert!(is_fatal(ErrorCode::SSL, true, None));
        assert!(is_fatal(ErrorCode::SSL, false, None));
    }

    #[test]
    fn test_revocation_codes() {
        assert!(revocation_code(&VerifyError::Chain("x".to_string())).is_none());
        let revoked = revocation_code(&VerifyError::CertificateRevoked).unwrap();
        assert_eq!(revoked.as_raw(), openssl_sys::X509_V_ERR_CERT_REVOKED);
        assert_eq!(revoked.error_string(), "certificate revoked");
    }

    #[test]
    fn test_handshake_retries_while_peer_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();

        let trust = TrustContext::new(Arc::new(PolicyMap::new()));
        let mut session = OpensslSession::new(stream.as_fd(), Role::Client, "localhost", trust).unwrap();

        assert_eq!(session.do_handshake(), Status::Retry);
        assert!(session.wants_input());
        assert!(!session.wants_output());
        assert_eq!(session.encrypted_read(&mut [0u8; 16]), Status::Retry);
        assert_eq!(session.encrypted_write(b"hello"), Status::Retry);
        assert!(session.last_error().is_none());
        assert!(!session.handshake_done());
    }

    #[test]
    fn test_server_role_never_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();

        let trust = TrustContext::new(Arc::new(PolicyMap::new()));
        let mut session = OpensslSession::new(stream.as_fd(), Role::Server, "", trust).unwrap();
        for _ in 0..3 {
            assert_eq!(session.do_handshake(), Status::Retry);
        }
        assert_eq!(session.encrypted_write(b"hello"), Status::Retry);
    }

    #[test]
    fn test_export_before_handshake_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let trust = TrustContext::new(Arc::new(PolicyMap::new()));
        let session = OpensslSession::new(stream.as_fd(), Role::Client, "localhost", trust).unwrap();
        assert!(matches!(
            session.export_session(),
            Err(TlsError::SessionResumptionFailed(_))
        ));
    }

    #[test]
    fn test_import_rejects_foreign_token() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let trust = TrustContext::new(Arc::new(PolicyMap::new()));
        let mut session = OpensslSession::new(stream.as_fd(), Role::Client, "localhost", trust).unwrap();
        assert!(matches!(
            session.import_session(ResumptionToken::Bytes(vec![0; 4])),
            Err(TlsError::SessionResumptionFailed(_))
        ));
    }

    #[test]
    fn test_mismatched_client_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client.key");
        std::fs::write(&cert, super::super::cert::fixtures::SERVER).unwrap();
        std::fs::write(&key, super::super::cert::fixtures::OTHER).unwrap();

        let policy = PolicyMap::new()
            .set(TlsOption::ClientCertFile, cert.to_string_lossy())
            .set(TlsOption::ClientKeyFile, key.to_string_lossy());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let trust = TrustContext::new(Arc::new(policy));
        assert!(matches!(
            OpensslSession::new(stream.as_fd(), Role::Client, "localhost", trust),
            Err(TlsError::Certificate(_))
        ));
    }
}
