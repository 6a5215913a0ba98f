//! Linux specific tun interface setup.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::IntoRawFd;
use std::path::Path;

use tracing::{debug, error};

use crate::error::{TunError, PRIVILEGE_HINT};
use crate::frame::Framing;
use crate::handle::OwnedHandle;
use crate::tun::{Backend, Opened};

/// Path to the tun clone device.
const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// TUN device, no Ethernet headers.
const IFF_TUN: libc::c_short = 0x0001;
/// Do not prepend packet information.
const IFF_NO_PI: libc::c_short = 0x1000;

/// Interface request as used by `TUNSETIFF`. Only the flags member of the kernel union is used,
/// the padding keeps the size equal to `struct ifreq`.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

impl IfReq {
    /// Create a request for the given name, truncated to fit `IFNAMSIZ` including the
    /// terminating 0 byte.
    fn new(name: &str) -> Self {
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: 0,
            _padding: [0; 22],
        };

        for (dst, src) in ifr
            .ifr_name
            .iter_mut()
            .zip(name.as_bytes().iter().take(libc::IFNAMSIZ - 1))
        {
            *dst = *src as libc::c_char;
        }

        ifr
    }

    fn with_flags(mut self, flags: libc::c_short) -> Self {
        self.ifr_flags = flags;
        self
    }

    /// The name in the request. After `TUNSETIFF`, this is the name assigned by the kernel.
    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

nix::ioctl_readwrite_bad!(
    /// Attach the tun file to an interface, creating it if needed. The kernel writes the name
    /// of the interface back into the request.
    tunsetiff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    IfReq
);

/// Backend which configures tun interfaces through `/dev/net/tun`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxBackend;

impl Backend for LinuxBackend {
    fn framing(&self) -> Framing {
        Framing::Raw
    }

    fn open(&self, requested_name: &str) -> Result<Opened, TunError> {
        if !Path::new(TUN_DEVICE_PATH).exists() {
            error!("{TUN_DEVICE_PATH} does not exist, is the tun kernel module loaded?");
            return Err(TunError::ControlDeviceMissing {
                path: TUN_DEVICE_PATH,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)
            .map_err(|e| {
                TunError::setup_with_hint("Failed to open /dev/net/tun", e, PRIVILEGE_HINT)
            })?;
        let handle = OwnedHandle::new(file.into_raw_fd());

        let mut ifr = IfReq::new(requested_name).with_flags(IFF_TUN | IFF_NO_PI);
        // SAFETY: the handle is open, and ifr is a valid, correctly sized and exclusively
        // borrowed ifreq.
        if let Err(e) = unsafe { tunsetiff(handle.get(), &mut ifr) } {
            error!(
                "Could not configure tun device named \"{requested_name}\", make sure the name is not yet in use, and you have sufficient privileges to create a network device"
            );
            return Err(TunError::setup_with_hint(
                "Failed to configure TUN device",
                io::Error::from(e),
                PRIVILEGE_HINT,
            ));
        }

        let name = ifr.name();
        debug!(fd = handle.get(), "Attached to tun interface {name}");

        Ok(Opened { handle, name })
    }
}
