//! TLS session interface
//!
//! A session wraps one connected, non-blocking descriptor that the caller
//! owns. Every operation returns immediately: when the backend cannot make
//! progress it reports [`Status::Retry`] and records which readiness it is
//! waiting for, and the caller re-invokes the same operation once the
//! descriptor is ready.

use super::config::TlsError;
use super::context::TrustContext;
use super::handshake::{Direction, HandshakeResult, Status};
use super::openssl_session::{OpensslResumption, OpensslSession};
use super::rustls_session::{RustlsResumption, RustlsSession};
use std::fmt;
use std::os::fd::BorrowedFd;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handshake role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    /// Accepting handshakes is not supported; server sessions never
    /// complete their handshake
    Server,
}

/// State shared by every backend
#[derive(Debug)]
pub struct SessionCore {
    hostname: String,
    role: Role,
    handshake_done: bool,
    error: Option<String>,
    fatal: bool,
    direction: Option<Direction>,
}

impl SessionCore {
    pub fn new(role: Role, hostname: impl Into<String>) -> Self {
        SessionCore {
            hostname: hostname.into(),
            role,
            handshake_done: false,
            error: None,
            fatal: false,
            direction: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Last error message, `"<operation>: <reason>"`
    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Readiness the last blocked transfer was waiting for
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn mark_handshake_done(&mut self) {
        self.handshake_done = true;
        self.direction = None;
    }

    /// Replace the stored error
    pub fn set_error(&mut self, operation: &str, reason: impl fmt::Display, fatal: bool) {
        let message = format!("{}: {}", operation, reason);
        debug!(host = %self.hostname, fatal, "{}", message);
        self.error = Some(message);
        self.fatal = fatal;
    }

    /// Record an error and report it
    pub fn fail<T>(&mut self, operation: &str, reason: impl fmt::Display, fatal: bool) -> Status<T> {
        self.set_error(operation, reason, fatal);
        Status::Error
    }

    /// Record what the backend is waiting for and ask for a retry
    pub fn wait<T>(&mut self, direction: Direction) -> Status<T> {
        trace!(host = %self.hostname, ?direction, "retry");
        self.direction = Some(direction);
        Status::Retry
    }

    /// Report a completed transfer
    pub fn done<T>(&mut self, value: T) -> Status<T> {
        self.direction = None;
        Status::Done(value)
    }
}

/// Cryptographic library behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    #[default]
    OpenSsl,
    Rustls,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::OpenSsl => "openssl",
            Backend::Rustls => "rustls",
        }
    }

    /// Wrap a connected descriptor in a session for this backend
    ///
    /// The descriptor should be in non-blocking mode. It is borrowed, not
    /// owned: dropping the session leaves it open.
    pub fn open<'fd>(
        self,
        fd: BorrowedFd<'fd>,
        role: Role,
        hostname: &str,
        trust: Arc<TrustContext>,
    ) -> Result<Box<dyn TlsSession + 'fd>, TlsError> {
        Ok(match self {
            Backend::OpenSsl => Box::new(OpensslSession::new(fd, role, hostname, trust)?),
            Backend::Rustls => Box::new(RustlsSession::new(fd, role, hostname, trust)?),
        })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openssl" => Ok(Backend::OpenSsl),
            "rustls" => Ok(Backend::Rustls),
            _ => Err(TlsError::InvalidConfig(format!("unknown TLS backend: {}", s))),
        }
    }
}

/// Resumption state exported from a completed session
///
/// Tokens are owned deep copies: the source session may be dropped before
/// the token is used.
pub enum ResumptionToken {
    OpenSsl(OpensslResumption),
    Rustls(RustlsResumption),
    /// Serialized state for backends outside this crate
    Bytes(Vec<u8>),
}

impl ResumptionToken {
    /// Backend that produced this token, if it is one of ours
    pub fn backend(&self) -> Option<Backend> {
        match self {
            ResumptionToken::OpenSsl(_) => Some(Backend::OpenSsl),
            ResumptionToken::Rustls(_) => Some(Backend::Rustls),
            ResumptionToken::Bytes(_) => None,
        }
    }
}

impl fmt::Debug for ResumptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumptionToken::OpenSsl(_) => f.write_str("ResumptionToken::OpenSsl(..)"),
            ResumptionToken::Rustls(_) => f.write_str("ResumptionToken::Rustls(..)"),
            ResumptionToken::Bytes(bytes) => write!(f, "ResumptionToken::Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Error for a token that cannot be imported into `backend`
pub(crate) fn token_mismatch(token: &ResumptionToken, backend: Backend) -> TlsError {
    let source = token.backend().map_or("external", |b| b.name());
    TlsError::SessionResumptionFailed(format!(
        "{} session cannot resume from {} session state",
        backend, source
    ))
}

/// A non-blocking TLS session over a borrowed descriptor
pub trait TlsSession {
    fn core(&self) -> &SessionCore;

    fn backend(&self) -> Backend;

    /// Advance the handshake
    ///
    /// Returns `Done` immediately once the handshake has completed.
    fn do_handshake(&mut self) -> HandshakeResult;

    /// Read decrypted data into `buf`
    ///
    /// Completes the handshake first. For a non-empty `buf`, `Done(0)` means
    /// the peer closed the connection cleanly. An empty `buf` returns
    /// `Done(0)` once the handshake is done, without touching the connection.
    fn encrypted_read(&mut self, buf: &mut [u8]) -> Status<usize>;

    /// Encrypt and send data from `buf`
    ///
    /// Completes the handshake first. Returns the number of bytes accepted.
    fn encrypted_write(&mut self, buf: &[u8]) -> Status<usize>;

    /// Whether the last retry was waiting for the descriptor to be readable
    fn wants_input(&self) -> bool;

    /// Whether the last retry was waiting for the descriptor to be writable
    fn wants_output(&self) -> bool;

    /// Export the negotiated session for resumption elsewhere
    fn export_session(&self) -> Result<ResumptionToken, TlsError>;

    /// Install a resumption token before this session's handshake starts
    fn import_session(&mut self, token: ResumptionToken) -> Result<(), TlsError>;

    /// Whether the completed handshake resumed an earlier session
    fn session_resumed(&self) -> bool;

    /// Copy resumption state from a completed session of the same backend
    fn copy_session_state(&mut self, source: &dyn TlsSession) -> Result<(), TlsError> {
        let token = source.export_session()?;
        self.import_session(token)
    }

    fn last_error(&self) -> Option<&str> {
        self.core().last_error()
    }

    fn is_fatal(&self) -> bool {
        self.core().is_fatal()
    }

    fn hostname(&self) -> &str {
        self.core().hostname()
    }

    fn role(&self) -> Role {
        self.core().role()
    }

    fn handshake_done(&self) -> bool {
        self.core().handshake_done()
    }
}
