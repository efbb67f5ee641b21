//! Wire representations.
//!
//! The module is split the usual way: an address-and-checksum part shared
//! with the (external) internet layer, and the TCP segment representation
//! itself. Each packet type has a byte-wrapper `Packet` for field access
//! and a high-level `Repr` that validates on `parse` and writes itself out
//! with `emit`.
use core::fmt;

pub mod ip;
pub mod tcp;

pub use ip::{IpAddress, Ipv4Address, Ipv6Address};
pub use tcp::{
    Checksum as TcpChecksum, Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr,
    SeqNumber as TcpSeqNumber, TcpOption,
};

/// The error type for parsing of the wire formats in this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The buffer is shorter than the format requires.
    Truncated,

    /// A field contains a value the format does not allow.
    Malformed,

    /// The segment checksum does not cover its contents.
    WrongChecksum,
}

/// The result type for the wire formats in this module.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated segment"),
            Error::Malformed => write!(f, "malformed segment"),
            Error::WrongChecksum => write!(f, "wrong checksum"),
        }
    }
}
