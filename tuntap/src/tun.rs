//! The tun module implements a platform independent tun backend.
//!
//! A [`Backend`] knows how to allocate a tun interface on the current platform, and how packets
//! are framed on the resulting handle. Reading, writing and putting the handle in non blocking
//! mode are the same on every supported platform, so the trait provides default implementations
//! for those.

use std::io::{self, IoSlice};
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::TunError;
use crate::frame::Framing;
use crate::handle::OwnedHandle;
use crate::sys;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "macos")]
pub use darwin::DarwinBackend;

#[cfg(test)]
pub(crate) mod mock;

/// A freshly allocated tun interface.
#[derive(Debug)]
pub struct Opened {
    /// The handle to the interface.
    pub handle: OwnedHandle,
    /// The name of the interface, as reported by the kernel.
    pub name: String,
}

/// Capability to create and drive tun interfaces on a platform.
pub trait Backend: Send + Sync + 'static {
    /// The framing used on handles created by this backend.
    fn framing(&self) -> Framing;

    /// Allocate a new tun interface. If `requested_name` is empty the kernel picks a name.
    ///
    /// The returned handle is still in blocking mode.
    fn open(&self, requested_name: &str) -> Result<Opened, TunError>;

    /// Put the handle in non blocking mode.
    fn set_nonblocking(&self, fd: RawFd) -> Result<(), TunError> {
        sys::set_nonblocking(fd)
    }

    /// Read a single frame, including any framing header.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        sys::read(fd, buf)
    }

    /// Write a single frame, made up of the given buffers.
    fn write(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        sys::writev(fd, bufs)
    }
}

/// The [`Backend`] for the platform we are compiled for.
#[cfg(target_os = "linux")]
pub fn platform() -> Arc<dyn Backend> {
    Arc::new(LinuxBackend)
}

/// The [`Backend`] for the platform we are compiled for.
#[cfg(target_os = "macos")]
pub fn platform() -> Arc<dyn Backend> {
    Arc::new(DarwinBackend)
}
