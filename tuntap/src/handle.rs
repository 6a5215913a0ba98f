//! Owned file descriptors.
//!
//! An [`OwnedHandle`] closes the descriptor it holds exactly once, either when it is reset or
//! when it is dropped. The actual close is delegated to a [`Closer`], which allows tests to
//! observe how often a descriptor is released.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::debug;

use crate::sys;

/// Value returned by [`OwnedHandle::get`] when no descriptor is held.
pub const NO_HANDLE: RawFd = -1;

/// Releases a file descriptor.
pub trait Closer: Send + Sync {
    /// Close `fd`. Errors are reported but never acted upon by the caller.
    fn close(&self, fd: RawFd) -> io::Result<()>;
}

/// [`Closer`] which closes the descriptor with the `close` system call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysCloser;

impl Closer for SysCloser {
    fn close(&self, fd: RawFd) -> io::Result<()> {
        sys::close(fd)
    }
}

/// A file descriptor with a single owner.
pub struct OwnedHandle {
    fd: RawFd,
    closer: Arc<dyn Closer>,
}

impl OwnedHandle {
    /// Take ownership of `fd`. It is closed with the `close` system call.
    pub fn new(fd: RawFd) -> Self {
        Self::with_closer(fd, Arc::new(SysCloser))
    }

    /// Take ownership of `fd`, which will be released through the given [`Closer`].
    pub fn with_closer(fd: RawFd, closer: Arc<dyn Closer>) -> Self {
        Self {
            fd: if fd < 0 { NO_HANDLE } else { fd },
            closer,
        }
    }

    /// An `OwnedHandle` which does not hold a descriptor.
    pub fn none() -> Self {
        Self::new(NO_HANDLE)
    }

    /// The held descriptor, or [`NO_HANDLE`].
    #[inline]
    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Whether a descriptor is held.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Give up ownership of the held descriptor without closing it.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, NO_HANDLE)
    }

    /// Close the held descriptor, if any, and hold `fd` instead.
    pub fn reset(&mut self, fd: Option<RawFd>) {
        let old = std::mem::replace(&mut self.fd, fd.filter(|fd| *fd >= 0).unwrap_or(NO_HANDLE));
        if old >= 0 {
            if let Err(e) = self.closer.close(old) {
                debug!(fd = old, "Failed to close file descriptor: {e}");
            }
        }
    }

    /// Move ownership out of this handle. `self` no longer holds a descriptor afterwards.
    pub fn take(&mut self) -> OwnedHandle {
        OwnedHandle {
            fd: self.release(),
            closer: self.closer.clone(),
        }
    }
}

impl Default for OwnedHandle {
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.reset(None);
    }
}

impl AsRawFd for OwnedHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedHandle").field(&self.fd).finish()
    }
}
