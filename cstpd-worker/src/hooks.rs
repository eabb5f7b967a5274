//! Narrow interfaces to the supervisor's subsystems.
//!
//! The worker never owns credentials, the session table or the routing
//! database; it consumes them through these traits. Tests substitute
//! in-memory implementations.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::AuthState;
use cstpd_core::COOKIE_SIZE;
use cstpd_core::http::Request;
use cstpd_core::session::{DatagramChannel, DtlsResumeParams, StreamChannel};

/// Builds the server-side TLS session on the accepted socket.
///
/// The implementation owns the credentials (certificate plus priority
/// string), honours the configured client certificate policy and
/// attaches the [`cstpd_core::session::ResumeCache`] callbacks.
#[async_trait]
pub trait TlsAcceptor: Send + Sync {
    /// Runs the TLS handshake to completion.
    async fn accept(&self, sock: tokio::net::TcpStream) -> anyhow::Result<Box<dyn StreamChannel>>;
}

/// Builds a DTLS server session resumed from the premaster the client
/// posted over TLS. No key exchange happens on UDP; the handshake that
/// follows only replays the resumed parameters.
pub trait DtlsSessionFactory: Send + Sync {
    /// Constructs the session over `socket`. The session starts with
    /// its handshake pending; the worker advances it on readability.
    fn resume(
        &self,
        params: DtlsResumeParams,
        socket: tokio::net::UdpSocket,
    ) -> anyhow::Result<Box<dyn DatagramChannel>>;
}

/// Verdict of the cookie oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieAuthResult {
    /// The cookie is valid; the client is who it claims to be.
    Granted,
    /// The cookie is unknown, expired or malformed.
    Denied,
}

/// The cookie authentication oracle. May consult shared state (a
/// session table) owned outside the worker.
#[async_trait]
pub trait CookieAuth: Send + Sync {
    /// Validates a cookie presented at CONNECT.
    async fn auth_cookie(&self, cookie: &[u8; COOKIE_SIZE]) -> CookieAuthResult;
}

/// IPv4 leg of the client's network placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Config {
    /// Address assigned to the client.
    pub address: Ipv4Addr,
    /// Netmask, when the network defines one.
    pub netmask: Option<Ipv4Addr>,
    /// DNS server, when the network defines one.
    pub dns: Option<Ipv4Addr>,
}

/// IPv6 leg of the client's network placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Config {
    /// Address assigned to the client.
    pub address: Ipv6Addr,
    /// Prefix length, when the network defines one.
    pub prefix: Option<u8>,
    /// DNS server, when the network defines one.
    pub dns: Option<Ipv6Addr>,
}

/// Runtime VPN parameters fetched once per CONNECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeVpnInfo {
    /// Base link MTU the tunnel MTUs are derived from.
    pub mtu: u16,
    /// IPv4 placement, when the network has one.
    pub ipv4: Option<Ipv4Config>,
    /// IPv6 placement, when the network has one.
    pub ipv6: Option<Ipv6Config>,
    /// Split-include routes pushed to the client.
    pub routes: Vec<IpNet>,
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            netmask: None,
            dns: None,
        }
    }
}

/// Supplies [`RuntimeVpnInfo`]. Callable once per CONNECT.
#[async_trait]
pub trait VpnInfoSource: Send + Sync {
    /// `None` means the server has nothing to place this client in.
    async fn get_rt_vpn_info(&self) -> Option<RuntimeVpnInfo>;
}

/// What a page handler did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Handled; re-enter the HTTP phase if the request was HTTP/1.1.
    Reenter,
    /// The handler has taken over (or finished) the session.
    Finished,
}

/// What an inline auth handler may touch.
pub struct AuthContext<'a> {
    /// Authentication state; handlers may set `auth_ok` and the cookie.
    pub auth: &'a mut AuthState,
    /// The control channel to answer on.
    pub tls: &'a mut dyn StreamChannel,
    /// The client's address.
    pub peer_addr: SocketAddr,
}

/// The supervisor's inline authentication handlers, dispatched from the
/// known-URL table.
#[async_trait]
pub trait AuthPages: Send + Sync {
    /// `GET /` and `GET /auth`: serve the auth form.
    async fn get_auth(
        &self,
        req: &Request,
        ctx: AuthContext<'_>,
    ) -> anyhow::Result<HandlerOutcome>;

    /// `POST /`: new-style auth submission.
    async fn post_new_auth(
        &self,
        req: &Request,
        ctx: AuthContext<'_>,
    ) -> anyhow::Result<HandlerOutcome>;

    /// `POST /auth`: old-style auth submission.
    async fn post_old_auth(
        &self,
        req: &Request,
        ctx: AuthContext<'_>,
    ) -> anyhow::Result<HandlerOutcome>;
}
