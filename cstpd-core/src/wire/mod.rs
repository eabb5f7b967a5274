//! Tunnel frame codecs.
//!
//! The reliable channel carries [`CstpFrame`]s inside TLS records, the
//! unreliable channel carries [`DtlsFrame`]s inside DTLS datagrams. Both
//! wrap the same payload and share one packet type space.

mod cstp;
mod dtls;

pub use cstp::CstpFrame;
pub use dtls::DtlsFrame;

use num_enum::{FromPrimitive, IntoPrimitive};

/// Tunnel packet types, shared by both channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    /// An IP packet for the tun device.
    Data = 0,
    /// Dead peer detection probe from the peer.
    DpdOut = 3,
    /// Answer to a dead peer detection probe.
    DpdResp = 4,
    /// Peer is going away.
    Disconn = 5,
    /// Keepalive, no payload.
    Keepalive = 7,
    /// Server-initiated termination.
    TermServer = 9,
    /// Anything else. Decoding is total; unknown types are the
    /// receiver's problem to log and skip.
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Framing failures.
///
/// A framing error is fatal for the channel it occurred on but must not
/// take down the process.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes for the fixed header.
    #[error("frame too short")]
    TooShort,
    /// The CSTP magic, version or reserved byte did not match.
    #[error("unrecognised CSTP header")]
    BadMagic,
    /// The claimed CSTP payload length disagrees with the record size.
    #[error("unexpected CSTP length (claimed {claimed}, available {available})")]
    BadLength {
        /// Payload length from the header.
        claimed: usize,
        /// Payload bytes actually present in the record.
        available: usize,
    },
}
