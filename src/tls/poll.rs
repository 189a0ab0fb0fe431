//! Readiness waiting for simple callers
//!
//! Event-loop owners call the session operations themselves; these helpers
//! cover the blocking-style case of "retry until it stops asking".

use super::handshake::Status;
use super::session::TlsSession;
use libc::{poll, pollfd, POLLIN, POLLOUT};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

/// Wait for the readiness `session` last asked for
///
/// Waits for input when the session expressed no preference. Returns
/// `false` on timeout.
pub fn wait_ready<S>(fd: BorrowedFd<'_>, session: &S, timeout: Option<Duration>) -> io::Result<bool>
where
    S: TlsSession + ?Sized,
{
    let mut events = 0;
    if session.wants_input() {
        events |= POLLIN;
    }
    if session.wants_output() {
        events |= POLLOUT;
    }
    if events == 0 {
        events = POLLIN;
    }

    let mut pfd = pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    loop {
        // SAFETY: pfd is a valid pollfd for the whole call and nfds is 1
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(result > 0);
    }
}

/// Re-invoke `op` until it stops returning `Retry`
///
/// Each wait is bounded by `timeout`; running out of time is reported as
/// `ErrorKind::TimedOut`.
pub fn drive<S, T, F>(
    session: &mut S,
    fd: BorrowedFd<'_>,
    timeout: Option<Duration>,
    mut op: F,
) -> io::Result<Status<T>>
where
    S: TlsSession + ?Sized,
    F: FnMut(&mut S) -> Status<T>,
{
    loop {
        match op(session) {
            Status::Retry => {
                if !wait_ready(fd, session, timeout)? {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for descriptor readiness",
                    ));
                }
            }
            status => return Ok(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::handshake::HandshakeResult;
    use super::super::session::{Backend, ResumptionToken, Role, SessionCore};
    use super::super::config::TlsError;
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsFd;

    /// Session that needs a fixed number of retries
    struct Countdown {
        core: SessionCore,
        retries: usize,
        calls: usize,
        output: bool,
    }

    impl TlsSession for Countdown {
        fn core(&self) -> &SessionCore {
            &self.core
        }
        fn backend(&self) -> Backend {
            Backend::OpenSsl
        }
        fn do_handshake(&mut self) -> HandshakeResult {
            self.calls += 1;
            if self.retries == 0 {
                return Status::Done(());
            }
            self.retries -= 1;
            Status::Retry
        }
        fn encrypted_read(&mut self, _buf: &mut [u8]) -> Status<usize> {
            Status::Retry
        }
        fn encrypted_write(&mut self, buf: &[u8]) -> Status<usize> {
            Status::Done(buf.len())
        }
        fn wants_input(&self) -> bool {
            false
        }
        fn wants_output(&self) -> bool {
            self.output
        }
        fn export_session(&self) -> Result<ResumptionToken, TlsError> {
            Ok(ResumptionToken::Bytes(Vec::new()))
        }
        fn import_session(&mut self, _token: ResumptionToken) -> Result<(), TlsError> {
            Ok(())
        }
        fn session_resumed(&self) -> bool {
            false
        }
    }

    fn countdown(retries: usize, output: bool) -> Countdown {
        Countdown {
            core: SessionCore::new(Role::Client, "localhost"),
            retries,
            calls: 0,
            output,
        }
    }

    #[test]
    fn test_drive_retries_until_done() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        // A connected socket is writable at once
        let mut session = countdown(3, true);
        let status = drive(&mut session, stream.as_fd(), Some(Duration::from_secs(5)), |s| {
            s.do_handshake()
        })
        .unwrap();

        assert_eq!(status, Status::Done(()));
        assert_eq!(session.calls, 4);
    }

    #[test]
    fn test_wait_times_out_without_input() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        // No preference: waits for input, which never comes
        let mut session = countdown(0, false);
        let err = drive(&mut session, stream.as_fd(), Some(Duration::from_millis(50)), |s| {
            s.encrypted_read(&mut [0u8; 8])
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_wait_reports_pending_input() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"x").unwrap();

        let session = countdown(0, false);
        assert!(wait_ready(stream.as_fd(), &session, Some(Duration::from_secs(5))).unwrap());
    }
}
