//! Non-blocking TLS sessions
//!
//! This module wraps a connected, non-blocking descriptor owned by the
//! caller in a TLS client session. Two backends implement the same
//! [`TlsSession`] interface: OpenSSL and rustls.
//!
//! # Architecture
//!
//! 1. [`TrustContext`] holds the policy source, the revocation store and the
//!    backend trust setup, shared by all sessions
//! 2. [`Backend::open`] wraps a descriptor in a session
//! 3. The caller invokes `do_handshake`, `encrypted_read` and
//!    `encrypted_write` whenever the descriptor is ready; `Retry` means
//!    "wait for `wants_input`/`wants_output`, then call again"
//! 4. While the backend validates the peer chain, each certificate passes
//!    through the [`CertificateVerifier`], which adds CRL checks and applies
//!    the per-host `verify-certificate` policy
//!
//! # Example
//!
//! ```no_run
//! use fdtls::tls::{poll, Backend, PolicyMap, Role, Status, TlsOption, TlsSession, TrustContext};
//! use std::net::TcpStream;
//! use std::os::fd::AsFd;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let policy = PolicyMap::new()
//!     .set(TlsOption::TrustAnchorFile, "/etc/ssl/certs/ca-certificates.crt")
//!     .set_for_host("lab.example.net", TlsOption::VerifyCertificate, "no");
//! let trust = TrustContext::initialize(Arc::new(policy));
//!
//! let stream = TcpStream::connect("ftp.example.net:990").unwrap();
//! stream.set_nonblocking(true).unwrap();
//!
//! let mut session = Backend::OpenSsl
//!     .open(stream.as_fd(), Role::Client, "ftp.example.net", trust)
//!     .unwrap();
//!
//! let timeout = Some(Duration::from_secs(30));
//! match poll::drive(session.as_mut(), stream.as_fd(), timeout, |s| s.do_handshake()).unwrap() {
//!     Status::Done(()) => println!("connected"),
//!     _ => eprintln!("handshake failed: {}", session.last_error().unwrap_or("unknown")),
//! }
//! ```

pub mod cert;
pub mod config;
pub mod context;
pub mod crl;
pub mod fdio;
pub mod handshake;
pub mod openssl_session;
pub mod poll;
pub mod rustls_session;
pub mod session;
pub mod verify;

pub use cert::{DistinguishedName, PeerCertificate, SerialNumber};
pub use config::{parse_bool, Policy, PolicyMap, TlsError, TlsOption};
pub use context::TrustContext;
pub use crl::{check_revocation, OpensslCrl, RevocationList, RevocationStore};
pub use handshake::{Direction, HandshakeResult, Status};
pub use openssl_session::OpensslSession;
pub use rustls_session::RustlsSession;
pub use session::{Backend, ResumptionToken, Role, SessionCore, TlsSession};
pub use verify::{CertificateVerifier, ChainLink, Verdict, VerificationState, VerifyError};

/// Result type for TLS setup operations
pub type Result<T> = std::result::Result<T, TlsError>;
