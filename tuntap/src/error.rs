//! Errors returned by tun devices and their backends.

use std::{fmt, io};

/// Hint attached to setup failures which are usually caused by missing privileges.
pub const PRIVILEGE_HINT: &str = "This usually means you don't have sufficient permissions. \
     Try running as root, grant the CAP_NET_ADMIN capability, or add your user to the 'tun' group.";

/// Hint attached when the kernel does not expose tun support.
pub const KERNEL_MODULE_HINT: &str =
    "Please ensure the TUN/TAP kernel module is loaded (modprobe tun).";

/// Error returned by operations on a [`TunDevice`](crate::device::TunDevice).
#[derive(Debug)]
pub enum TunError {
    /// A shutdown was requested on the [`ShutdownCoordinator`](crate::shutdown::ShutdownCoordinator),
    /// no new work is accepted.
    ShutdownInProgress,
    /// The device is not open.
    NotOpen,
    /// The device was explicitly closed, it can't be opened again.
    Closed,
    /// The kernel control device used to allocate tun interfaces does not exist.
    ControlDeviceMissing {
        /// Path of the missing control device.
        path: &'static str,
    },
    /// A system call failed while setting up the interface.
    Setup {
        /// What we were doing when the call failed.
        context: &'static str,
        /// The underlying OS error.
        source: io::Error,
        /// Optional remediation hint for the user.
        hint: Option<&'static str>,
    },
    /// All utun units are in use.
    NoFreeUnit,
    /// The device handle could not be registered with the event loop.
    Poll(io::Error),
    /// Reading from the device failed.
    Read(io::Error),
    /// Writing to the device failed.
    Write(io::Error),
}

impl TunError {
    /// Create a new [`TunError::Setup`] without remediation hint.
    pub(crate) fn setup(context: &'static str, source: io::Error) -> Self {
        Self::Setup {
            context,
            source,
            hint: None,
        }
    }

    /// Create a new [`TunError::Setup`] carrying a remediation hint.
    pub(crate) fn setup_with_hint(
        context: &'static str,
        source: io::Error,
        hint: &'static str,
    ) -> Self {
        Self::Setup {
            context,
            source,
            hint: Some(hint),
        }
    }
}

impl fmt::Display for TunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutdownInProgress => f.write_str("Shutdown in progress"),
            Self::NotOpen => f.write_str("Device not open"),
            Self::Closed => f.write_str("Device was closed and can't be reopened"),
            Self::ControlDeviceMissing { path } => write!(
                f,
                "TUN/TAP device not available: {path} does not exist. {KERNEL_MODULE_HINT}"
            ),
            Self::Setup {
                context,
                source,
                hint: Some(hint),
            } => write!(f, "{context}: {source}. {hint}"),
            Self::Setup {
                context,
                source,
                hint: None,
            } => write!(f, "{context}: {source}"),
            Self::NoFreeUnit => f.write_str("Could not find an available utun device"),
            Self::Poll(e) => write!(f, "Failed to start polling: {e}"),
            Self::Read(e) => write!(f, "Read error: {e}"),
            Self::Write(e) => write!(f, "Write error: {e}"),
        }
    }
}

impl std::error::Error for TunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Setup { source, .. } => Some(source),
            Self::Poll(e) | Self::Read(e) | Self::Write(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::io;

    use super::{TunError, KERNEL_MODULE_HINT, PRIVILEGE_HINT};

    #[test]
    fn setup_error_mentions_hint() {
        let err = TunError::setup_with_hint(
            "Failed to configure TUN device",
            io::Error::from_raw_os_error(libc::EPERM),
            PRIVILEGE_HINT,
        );
        let msg = err.to_string();

        assert!(msg.starts_with("Failed to configure TUN device: "));
        assert!(msg.ends_with(PRIVILEGE_HINT));
        assert!(err.source().is_some());
    }

    #[test]
    fn missing_control_device_mentions_module() {
        let err = TunError::ControlDeviceMissing {
            path: "/dev/net/tun",
        };

        assert!(err.to_string().contains("/dev/net/tun"));
        assert!(err.to_string().contains(KERNEL_MODULE_HINT));
        assert!(err.source().is_none());
    }
}
