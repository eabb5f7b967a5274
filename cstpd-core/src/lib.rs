//! The core CSTP tunneling protocol.
//!
//! Framing for the two tunnel channels, incremental parsing of the
//! HTTP/1.x control phase, the DTLS data MTU estimator, and the session
//! seams the per-connection worker is built against.

#![warn(missing_docs)]

pub mod http;
pub mod mtu;
pub mod session;
pub mod wire;

pub use session::{
    DatagramChannel, DatagramSendResult, DtlsResumeParams, HandshakeOutcome, IOCallbackResult,
    ResumeCache, SessionId, StreamChannel,
};

/// Size of the `webvpn` authentication cookie in bytes.
pub const COOKIE_SIZE: usize = 32;

/// Size of the DTLS premaster secret passed over the TLS channel.
pub const TLS_MASTER_SIZE: usize = 48;

/// Size of the server-chosen DTLS session id.
pub const SESSION_ID_SIZE: usize = 32;

/// The smallest DTLS data MTU worth operating with. Bisecting below this
/// disables the datagram channel.
pub const MIN_DTLS_MTU: u16 = 128;

/// Size of the scratch buffer shared by the control phase and the data
/// loop. Bounds the negotiated CSTP and DTLS MTUs.
pub const TUNNEL_BUFFER_SIZE: usize = 4 * 1024;
