//! Worker configuration.
//!
//! A read-only snapshot deserialized by the supervisor and handed to
//! each worker at spawn time. The worker consults no environment of its
//! own.

use bytesize::ByteSize;
use serde::Deserialize;

/// Client certificate policy applied by the TLS acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateRequest {
    /// Do not ask for a client certificate.
    #[default]
    Ignore,
    /// Ask, but accept connections without one.
    Request,
    /// Ask and require one.
    Require,
}

/// Per-connection worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds an unauthenticated client may hold the connection before
    /// the watchdog kills the worker. 0 disables the watchdog.
    pub auth_timeout: u32,
    /// Dead peer detection interval advertised to the client, seconds.
    /// The worker gives up after three missed intervals.
    pub dpd: u32,
    /// Keepalive interval advertised to the client, seconds.
    pub keepalive: u32,
    /// Cookie lifetime, seconds. Also drives the DTLS rekey hint.
    pub cookie_validity: u32,
    /// UDP port advertised for the DTLS channel.
    pub udp_port: u16,
    /// Client certificate policy for the TLS handshake.
    pub cert_req: CertificateRequest,
    /// Name of the network clients are placed in. CONNECT is refused
    /// when no network is configured.
    pub network_name: Option<String>,
    /// Kernel buffer size applied to the UDP socket at startup.
    /// 0 leaves the kernel default in place.
    pub udp_buffer_size: ByteSize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            auth_timeout: 40,
            dpd: 60,
            keepalive: 32400,
            cookie_validity: 86400,
            udp_port: 443,
            cert_req: CertificateRequest::default(),
            network_name: None,
            udp_buffer_size: ByteSize::b(0),
        }
    }
}
