//! Retry/error classification
//!
//! Every backend call ends in one of three ways: it completed, it must be
//! retried once the descriptor becomes ready, or it failed. This module
//! holds the shared result type and the rules that sort low-level I/O
//! errors into those outcomes.

use std::io;

/// Outcome of a session operation
///
/// `Retry` carries no continuation state: re-invoking the same operation
/// recomputes everything from the backend's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status<T> {
    /// The operation completed
    Done(T),
    /// Wait for descriptor readiness, then call again
    Retry,
    /// The operation failed; see the session's error message and fatality
    Error,
}

/// Handshake result
pub type HandshakeResult = Status<()>;

impl<T> Status<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Status::Done(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Status::Retry)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error)
    }

    /// Map the completion value
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Status<U> {
        match self {
            Status::Done(value) => Status::Done(f(value)),
            Status::Retry => Status::Retry,
            Status::Error => Status::Error,
        }
    }

    /// Get the completion value, if any
    pub fn done(self) -> Option<T> {
        match self {
            Status::Done(value) => Some(value),
            _ => None,
        }
    }
}

impl HandshakeResult {
    /// `None` when the handshake is finished, otherwise the status to hand
    /// back from a read or write that has to wait for it
    pub fn unfinished<U>(self) -> Option<Status<U>> {
        match self {
            Status::Done(()) => None,
            Status::Retry => Some(Status::Retry),
            Status::Error => Some(Status::Error),
        }
    }
}

/// Readiness the backend is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// More protocol data must arrive from the peer
    Input,
    /// Buffered protocol data must be sent to the peer
    Output,
}

/// Classification of an I/O error raised underneath a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Would block or interrupted: retry the same call
    Transient,
    /// A network condition that may clear on reconnect: non-fatal error
    Temporary,
    /// Anything else: the connection must be abandoned
    Fatal,
}

/// Check whether an OS error number is a temporary network condition
pub fn temporary_network_errno(errno: i32) -> bool {
    matches!(
        errno,
        libc::EPIPE
            | libc::EIO
            | libc::ETIMEDOUT
            | libc::ECONNRESET
            | libc::ECONNREFUSED
            | libc::ECONNABORTED
            | libc::ENOTCONN
            | libc::ENETDOWN
            | libc::ENETUNREACH
            | libc::ENETRESET
            | libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::ENOBUFS
            | libc::EAGAIN
            | libc::EINTR
    )
}

/// Check whether an I/O error is a temporary network condition
pub fn temporary_network_error(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(errno) => temporary_network_errno(errno),
        None => matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        ),
    }
}

/// Classify an I/O error
pub fn classify_io(err: &io::Error) -> IoClass {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => IoClass::Transient,
        _ if temporary_network_error(err) => IoClass::Temporary,
        _ => IoClass::Fatal,
    }
}
