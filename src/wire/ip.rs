//! Internet addresses and the internet checksum.
//!
//! The engine does not parse or emit IP headers. It still needs addresses
//! to key connections and to compute the TCP pseudo-header checksum, so
//! those two pieces live here.
use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};

/// A four-octet IPv4 address.
#[derive(Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Ipv4Address(pub [u8; 4]);

/// A sixteen-octet IPv6 address.
#[derive(Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Ipv6Address(pub [u8; 16]);

/// An internet address of either family.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum IpAddress {
    Ipv4(Ipv4Address),
    Ipv6(Ipv6Address),
}

impl Ipv4Address {
    /// Construct an address from its octets.
    pub fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Ipv4Address {
        Ipv4Address([a0, a1, a2, a3])
    }

    /// View the address as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Ipv6Address {
    /// View the address as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl IpAddress {
    /// View the address as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IpAddress::Ipv4(addr) => addr.as_bytes(),
            IpAddress::Ipv6(addr) => addr.as_bytes(),
        }
    }
}

impl From<Ipv4Address> for IpAddress {
    fn from(addr: Ipv4Address) -> Self {
        IpAddress::Ipv4(addr)
    }
}

impl From<Ipv6Address> for IpAddress {
    fn from(addr: Ipv6Address) -> Self {
        IpAddress::Ipv6(addr)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ipv4Address([a, b, c, d]) = self;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", NetworkEndian::read_u16(chunk))?;
        }
        Ok(())
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpAddress::Ipv4(addr) => addr.fmt(f),
            IpAddress::Ipv6(addr) => addr.fmt(f),
        }
    }
}

pub(crate) mod checksum {
    use super::IpAddress;
    use byteorder::{ByteOrder, NetworkEndian};

    const PROTO_TCP: u8 = 6;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum: u32 = 0;

        while data.len() >= 2 {
            accum += u32::from(NetworkEndian::read_u16(data));
            data = &data[2..];
        }

        if let Some(&value) = data.first() {
            accum += u32::from(value) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += u32::from(word);
        }
        propagate_carries(accum)
    }

    /// Compute the TCP pseudo-header checksum.
    ///
    /// The families of the two addresses must match; the caller constructs
    /// the pair from a single received or routed datagram so they always do.
    pub(crate) fn pseudo_header(src_addr: &IpAddress, dst_addr: &IpAddress, length: u32) -> u16 {
        match (src_addr, dst_addr) {
            (IpAddress::Ipv4(_), IpAddress::Ipv4(_)) => {
                let mut proto_len = [0u8; 4];
                proto_len[1] = PROTO_TCP;
                NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

                combine(&[
                    data(src_addr.as_bytes()),
                    data(dst_addr.as_bytes()),
                    data(&proto_len[..]),
                ])
            }

            (IpAddress::Ipv6(_), IpAddress::Ipv6(_)) => {
                let mut proto_len = [0u8; 8];
                proto_len[7] = PROTO_TCP;
                NetworkEndian::write_u32(&mut proto_len[0..4], length);
                combine(&[
                    data(src_addr.as_bytes()),
                    data(dst_addr.as_bytes()),
                    data(&proto_len[..]),
                ])
            }

            _ => panic!("pseudo header address families do not match: {}, {}", src_addr, dst_addr),
        }
    }
}
