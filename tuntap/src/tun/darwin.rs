//! macos specific tun interface setup.
//!
//! Utun interfaces are created by connecting a kernel control socket to the utun control. The
//! unit number used to connect determines the interface name: unit `n` creates `utun{n-1}`.

use std::ffi::CStr;
use std::io;
use std::mem;

use tracing::{debug, error};

use crate::error::{TunError, PRIVILEGE_HINT};
use crate::frame::Framing;
use crate::handle::OwnedHandle;
use crate::tun::{Backend, Opened};

/// Name of the kernel control managing utun interfaces.
const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
/// Socket option to query the interface name of a connected utun control socket.
const UTUN_OPT_IFNAME: libc::c_int = 2;
/// Units are scanned up to, but not including, this value when no name is requested.
const MAX_UTUN_UNIT: u32 = 255;
/// Room for "utun" + unit + 0 byte.
const IFNAME_BUF_LEN: usize = 20;

nix::ioctl_readwrite!(
    /// Resolve a kernel control name to its id.
    ctliocginfo,
    b'N',
    3,
    libc::ctl_info
);

/// Backend which creates utun interfaces through a kernel control socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct DarwinBackend;

impl Backend for DarwinBackend {
    fn framing(&self) -> Framing {
        Framing::AddressFamily
    }

    fn open(&self, requested_name: &str) -> Result<Opened, TunError> {
        // SAFETY: plain socket creation, the result is checked below.
        let handle = OwnedHandle::new(unsafe {
            libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL)
        });
        if !handle.is_valid() {
            return Err(TunError::setup_with_hint(
                "Failed to create control socket",
                io::Error::last_os_error(),
                PRIVILEGE_HINT,
            ));
        }

        // SAFETY: ctl_info is plain old data, all zeroes is a valid value.
        let mut info: libc::ctl_info = unsafe { mem::zeroed() };
        for (dst, src) in info
            .ctl_name
            .iter_mut()
            .zip(UTUN_CONTROL_NAME.iter().take(info.ctl_name.len() - 1))
        {
            *dst = *src as libc::c_char;
        }
        // SAFETY: the handle is a valid control socket and info is a valid ctl_info.
        if let Err(e) = unsafe { ctliocginfo(handle.get(), &mut info) } {
            return Err(TunError::setup(
                "Failed to get utun control info",
                io::Error::from(e),
            ));
        }

        // SAFETY: sockaddr_ctl is plain old data, all zeroes is a valid value.
        let mut addr: libc::sockaddr_ctl = unsafe { mem::zeroed() };
        addr.sc_len = mem::size_of::<libc::sockaddr_ctl>() as libc::c_uchar;
        addr.sc_family = libc::AF_SYSTEM as libc::c_uchar;
        addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
        addr.sc_id = info.ctl_id;

        match requested_unit(requested_name) {
            Some(unit) => {
                addr.sc_unit = unit;
                if let Err(e) = connect(&handle, &addr) {
                    error!("Could not connect to utun unit {unit} for \"{requested_name}\"");
                    return Err(TunError::setup(
                        "Failed to connect to utun control socket with specified unit",
                        e,
                    ));
                }
            }
            None => {
                let mut connected = false;
                for unit in 1..MAX_UTUN_UNIT {
                    addr.sc_unit = unit;
                    match connect(&handle, &addr) {
                        Ok(()) => {
                            connected = true;
                            break;
                        }
                        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => continue,
                        Err(e) => {
                            return Err(TunError::setup(
                                "Failed to connect to utun control socket",
                                e,
                            ))
                        }
                    }
                }
                if !connected {
                    return Err(TunError::NoFreeUnit);
                }
            }
        }

        let name = interface_name(&handle)?;
        debug!(fd = handle.get(), "Created utun interface {name}");

        Ok(Opened { handle, name })
    }
}

/// The control unit to connect to for a requested interface name, if the name selects a
/// specific utun interface. Only the digits directly following `utun` are considered, so
/// `utun5x` selects `utun5`.
fn requested_unit(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix("utun")?;
    let digits = suffix
        .find(|c: char| !c.is_ascii_digit())
        .map_or(suffix, |end| &suffix[..end]);

    digits.parse::<u32>().ok()?.checked_add(1)
}

fn connect(handle: &OwnedHandle, addr: &libc::sockaddr_ctl) -> io::Result<()> {
    // SAFETY: addr is a valid sockaddr_ctl and the passed length matches its size.
    let res = unsafe {
        libc::connect(
            handle.get(),
            (addr as *const libc::sockaddr_ctl).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Name of the utun interface created by connecting the control socket.
fn interface_name(handle: &OwnedHandle) -> Result<String, TunError> {
    let mut buf = [0u8; IFNAME_BUF_LEN];
    let mut len = buf.len() as libc::socklen_t;
    // SAFETY: buf is valid for len bytes.
    let res = unsafe {
        libc::getsockopt(
            handle.get(),
            libc::SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            buf.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if res < 0 {
        return Err(TunError::setup(
            "Failed to get utun interface name",
            io::Error::last_os_error(),
        ));
    }

    let name = CStr::from_bytes_until_nul(&buf)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..len as usize]).into_owned());
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::requested_unit;

    #[test]
    fn unit_from_name() {
        assert_eq!(requested_unit("utun0"), Some(1));
        assert_eq!(requested_unit("utun7"), Some(8));
        assert_eq!(requested_unit("utun5x"), Some(6));
        assert_eq!(requested_unit("utun12.1"), Some(13));
        assert_eq!(requested_unit("utun"), None);
        assert_eq!(requested_unit("utunx"), None);
        assert_eq!(requested_unit("tun0"), None);
        assert_eq!(requested_unit(""), None);
    }
}
