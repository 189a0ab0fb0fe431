//! Borrowed descriptor I/O
//!
//! Backends need `Read + Write` over the caller's socket without taking
//! ownership of it: dropping a session must never close the descriptor.

use socket2::SockRef;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

/// Non-owning `Read`/`Write` adapter over a connected socket
#[derive(Debug, Clone, Copy)]
pub struct FdIo<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> FdIo<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        FdIo { fd }
    }
}

impl AsFd for FdIo<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd
    }
}

impl Read for FdIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = SockRef::from(&self.fd);
        (&*socket).read(buf)
    }
}

impl Write for FdIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let socket = SockRef::from(&self.fd);
        (&*socket).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
