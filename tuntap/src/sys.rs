//! Thin wrappers around the raw file descriptor system calls used by the tun backends.

use std::io::{self, IoSlice};
use std::os::fd::RawFd;

use crate::error::TunError;

/// Close a file descriptor.
pub fn close(fd: RawFd) -> io::Result<()> {
    // SAFETY: closing an fd has no memory safety implications, an invalid fd yields EBADF.
    if unsafe { libc::close(fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read a single frame from `fd` into `buf`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the pointer and length come from a valid mutable slice.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write all `bufs` to `fd` in a single system call, so they end up in a single frame.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let iovcnt = libc::c_int::try_from(bufs.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many buffers"))?;
    // SAFETY: IoSlice is guaranteed to be ABI compatible with iovec on unix.
    let n = unsafe { libc::writev(fd, bufs.as_ptr().cast::<libc::iovec>(), iovcnt) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Duplicate a file descriptor. The new descriptor has the close-on-exec flag set.
pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: F_DUPFD_CLOEXEC only creates a new descriptor.
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(new)
}

/// Put `fd` in non blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<(), TunError> {
    // SAFETY: F_GETFL and F_SETFL only manipulate the status flags of the descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(TunError::setup(
            "Failed to get file descriptor flags",
            io::Error::last_os_error(),
        ));
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(TunError::setup(
            "Failed to set non-blocking mode",
            io::Error::last_os_error(),
        ));
    }

    Ok(())
}
