//! Seams between the worker and the TLS/DTLS record layer.
//!
//! The worker never talks to a crypto library directly: the supervisor
//! hands it sessions behind these traits. Tests drive the worker with
//! in-memory channels.

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::{SESSION_ID_SIZE, TLS_MASTER_SIZE};

/// Result of a non-blocking channel operation.
#[derive(Debug)]
pub enum IOCallbackResult<T> {
    /// The operation succeeded.
    Ok(T),
    /// The operation would have blocked; wait for readiness and retry.
    WouldBlock,
    /// The operation failed.
    Err(io::Error),
}

/// Outcome of a datagram send through a DTLS session.
#[derive(Debug)]
pub enum DatagramSendResult {
    /// The datagram went out; the value is the wire size including the
    /// tunnel frame header.
    Sent(usize),
    /// The datagram exceeded the session data MTU. The caller shrinks
    /// the MTU estimate and retries the packet on the stream channel.
    LargePacket,
    /// The socket would have blocked.
    WouldBlock,
    /// Fatal session error.
    Err(io::Error),
}

/// Outcome of advancing a DTLS handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The handshake finished; the session carries application data now.
    Complete,
    /// More peer flights are needed; wait for readability.
    InProgress,
    /// A handshake flight exceeded the transport MTU. Shrink and retry.
    LargePacket,
    /// The handshake failed.
    Fatal(io::Error),
}

/// The reliable, record-oriented TLS channel.
#[async_trait]
pub trait StreamChannel: Send {
    /// Whether decoded records are already buffered in the session.
    /// A loop must consume these before waiting for socket readiness.
    fn pending(&self) -> bool;

    /// Waits until a record read may make progress.
    async fn readable(&self) -> io::Result<()>;

    /// Reads one decoded record into `buf`. `Ok(0)` means the peer
    /// closed the session.
    fn try_recv(&mut self, buf: &mut BytesMut) -> IOCallbackResult<usize>;

    /// Writes `buf` in full, waiting for the transport as needed.
    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Orderly close, best effort.
    async fn close(&mut self);

    /// Closes with a fatal access-denied alert where the backend
    /// supports one, best effort.
    async fn fatal_close(&mut self);
}

/// The unreliable, datagram-oriented DTLS channel.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Whether decoded datagrams are already buffered in the session.
    fn pending(&self) -> bool;

    /// Waits until a datagram read may make progress.
    async fn readable(&self) -> io::Result<()>;

    /// Reads one decoded datagram into `buf`.
    fn try_recv(&mut self, buf: &mut BytesMut) -> IOCallbackResult<usize>;

    /// Sends one datagram.
    fn try_send(&mut self, buf: &[u8]) -> DatagramSendResult;

    /// Advances the server-side handshake as far as buffered peer
    /// flights allow.
    fn step_handshake(&mut self) -> HandshakeOutcome;

    /// Sets the session data MTU.
    fn set_data_mtu(&mut self, mtu: u16);

    /// The negotiated session data MTU.
    fn data_mtu(&self) -> u16;

    /// Orderly close, best effort.
    async fn close(&mut self);
}

/// TLS session resume cache, exposed by the supervisor and attached to
/// sessions by the acceptor that builds them.
pub trait ResumeCache: Send + Sync {
    /// Stores a session under `key`.
    fn store(&self, key: &[u8], value: &[u8]);
    /// Looks up a stored session.
    fn retrieve(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Drops a stored session.
    fn delete(&self, key: &[u8]);
}

/// The server-chosen DTLS session id, advertised lowercase-hex in
/// `X-DTLS-Session-ID`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// A freshly generated random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl From<[u8; SESSION_ID_SIZE]> for SessionId {
    fn from(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Everything a DTLS backend needs to resume the legacy AnyConnect
/// session from key material exchanged over the TLS channel.
///
/// The remaining parameters are fixed by wire compatibility and are part
/// of the factory contract: DTLS v0.9, RSA key exchange, AES-128-CBC,
/// SHA-1 MAC, no compression, renegotiation disabled, client
/// certificates ignored.
pub struct DtlsResumeParams {
    /// The premaster secret the client posted in `X-DTLS-Master-Secret`.
    pub premaster: [u8; TLS_MASTER_SIZE],
    /// The server-chosen session id.
    pub session_id: SessionId,
}

impl DtlsResumeParams {
    /// The cleartext ciphersuite name advertised to the peer in
    /// `X-DTLS-CipherSuite`. Not a negotiated suite in the TLS sense.
    pub const CIPHERSUITE: &'static str = "AES128-SHA";
}

impl std::fmt::Debug for DtlsResumeParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The premaster is key material; keep it out of logs.
        f.debug_struct("DtlsResumeParams")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
