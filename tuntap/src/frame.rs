//! Per platform framing of packets read from and written to a tun device.
//!
//! Linux tun devices opened with `IFF_NO_PI` carry bare IP packets. Darwin utun devices prepend
//! a 4 byte address family, in network byte order, to every packet.

use bytes::Bytes;

/// Size of the address family header of utun frames.
pub const HEADER_LEN: usize = 4;

/// `AF_INET6` as defined by the BSD network stack, in network byte order. Outbound frames are
/// always tagged with this family.
pub const AF_INET6_HEADER: [u8; HEADER_LEN] = [0, 0, 0, 30];

/// The way packets are framed on a tun handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Packets are read and written as is.
    Raw,
    /// Every packet is prefixed with a 4 byte address family header.
    AddressFamily,
}

impl Framing {
    /// The amount of bytes added to every packet on the wire.
    #[inline]
    pub const fn overhead(self) -> usize {
        match self {
            Framing::Raw => 0,
            Framing::AddressFamily => HEADER_LEN,
        }
    }

    /// The header to write in front of an outbound packet.
    #[inline]
    pub const fn header(self) -> &'static [u8] {
        match self {
            Framing::Raw => &[],
            Framing::AddressFamily => &AF_INET6_HEADER,
        }
    }

    /// Extract the packet from a frame read from the device.
    ///
    /// Returns [`None`] if the frame holds nothing past its header.
    pub fn payload(self, frame: Bytes) -> Option<Bytes> {
        match self {
            Framing::Raw => Some(frame),
            Framing::AddressFamily if frame.len() > HEADER_LEN => Some(frame.slice(HEADER_LEN..)),
            Framing::AddressFamily => None,
        }
    }

    /// Convert the amount of bytes accepted by a write system call to the amount of payload
    /// bytes written.
    #[inline]
    pub const fn payload_written(self, written: usize) -> usize {
        written.saturating_sub(self.overhead())
    }
}
