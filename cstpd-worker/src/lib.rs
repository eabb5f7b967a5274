//! The per-connection VPN worker.
//!
//! One task services a single client from TLS handshake through
//! authenticated tunnel operation, multiplexing user IP traffic over a
//! reliable TLS channel and an unreliable DTLS channel to and from a tun
//! device. The listener/supervisor that accepts sockets, the credential
//! store, the cookie oracle and the tun allocator all live elsewhere;
//! the worker consumes them through the seams in [`hooks`] and
//! [`cstpd_core::session`].

pub mod command;
pub mod config;
mod connect;
pub mod hooks;
mod http_phase;
pub mod io;
pub mod lifecycle;
mod metrics;
#[cfg(test)]
pub(crate) mod testutil;
mod tunnel;

pub use command::{Command, CommandChannel};
pub use config::{CertificateRequest, WorkerConfig};
pub use hooks::{
    AuthContext, AuthPages, CookieAuth, CookieAuthResult, DtlsSessionFactory, HandlerOutcome,
    Ipv4Config, Ipv6Config, RuntimeVpnInfo, TlsAcceptor, VpnInfoSource,
};
pub use io::{InsideIO, TunDevice};
pub use lifecycle::{AuthWatchdog, ShutdownFlag};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use cstpd_core::http::ParseError;
use cstpd_core::mtu::MtuEstimator;
use cstpd_core::session::{DatagramChannel, SessionId, StreamChannel};
use cstpd_core::wire::FrameError;
use cstpd_core::{COOKIE_SIZE, TLS_MASTER_SIZE};

/// HTTP requests a single connection may issue before it is cut off.
pub const MAX_HTTP_REQUESTS: u32 = 8;

/// State of the datagram channel. Ordered: everything past
/// [`UdpState::WaitFd`] participates in the readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UdpState {
    /// No UDP for this connection, ever (or given up on).
    Disabled,
    /// Premaster received; waiting for the supervisor to attach the flow.
    WaitFd,
    /// Flow attached; build the DTLS session on first readability.
    Setup,
    /// Resumed session built; handshake in flight.
    Handshake,
    /// Session is up but the client currently sends over TLS.
    Inactive,
    /// Session is up and carrying data.
    Active,
}

/// Authentication material accumulated over the control phase.
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct AuthState {
    /// Set by an inline auth handler or by cookie validation at CONNECT.
    pub auth_ok: bool,
    /// The validated cookie.
    #[educe(Debug(ignore))]
    pub cookie: Option<[u8; COOKIE_SIZE]>,
    /// The DTLS premaster posted by the client.
    #[educe(Debug(ignore))]
    pub master_secret: Option<[u8; TLS_MASTER_SIZE]>,
    /// Server-chosen DTLS session id.
    pub session_id: SessionId,
}

impl AuthState {
    fn new() -> Self {
        Self {
            auth_ok: false,
            cookie: None,
            master_secret: None,
            session_id: SessionId::random(),
        }
    }
}

/// Ways a worker dies. Every variant is terminal for the connection;
/// the supervisor maps any error to a non-zero process exit.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// CONNECT arrived without a cookie.
    #[error("connect request without authentication")]
    ConnectWithoutAuth,
    /// The cookie oracle rejected the cookie.
    #[error("failed cookie authentication attempt")]
    CookieRejected,
    /// CONNECT path was not the tunnel endpoint.
    #[error("bad connect request '{0}'")]
    BadConnectPath(String),
    /// No network is configured for clients.
    #[error("no networks are configured")]
    NoNetworks,
    /// The vpn-info oracle produced nothing.
    #[error("VPN network information is unavailable")]
    VpnInfoUnavailable,
    /// The request budget ran out.
    #[error("maximum number of HTTP requests reached")]
    RequestBudgetExhausted,
    /// The control channel failed mid-request.
    #[error("error receiving client data")]
    ControlReceive,
    /// The control bytes did not parse as HTTP.
    #[error(transparent)]
    Http(#[from] ParseError),
    /// A tunnel frame did not parse.
    #[error("error parsing tunnel data: {0}")]
    Framing(#[from] FrameError),
    /// The peer closed the TLS session.
    #[error("client disconnected")]
    PeerClosed,
    /// No DPD answer for three intervals.
    #[error("have not received DPD for long")]
    DpdTimeout,
    /// The tun device reached end of stream.
    #[error("TUN device returned zero")]
    TunClosed,
    /// The tun device failed hard.
    #[error("tun device error: {0}")]
    Tun(#[source] std::io::Error),
    /// The supervisor pipe closed or failed.
    #[error("command channel error")]
    CommandChannel,
    /// Record-layer I/O failed.
    #[error("channel error: {0}")]
    Io(#[from] std::io::Error),
    /// A supervisor-provided hook failed.
    #[error("session setup failed: {0}")]
    Setup(#[source] anyhow::Error),
    /// An inline auth handler failed.
    #[error("request handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

/// Everything the supervisor hands a freshly spawned worker.
pub struct WorkerArgs {
    /// Immutable configuration snapshot.
    pub config: Arc<WorkerConfig>,
    /// The client's address.
    pub peer_addr: SocketAddr,
    /// The accepted TCP socket, not yet wrapped in TLS.
    pub tcp: tokio::net::TcpStream,
    /// A bound UDP socket, not yet tied to the peer.
    pub udp: tokio::net::UdpSocket,
    /// The tun device allocated for this client.
    pub tun: Arc<dyn InsideIO>,
    /// The worker end of the supervisor pipe.
    pub command: CommandChannel,
    /// Builds the TLS session (credentials and resume cache attached).
    pub tls_acceptor: Arc<dyn TlsAcceptor>,
    /// Builds resumed DTLS sessions.
    pub dtls_factory: Arc<dyn DtlsSessionFactory>,
    /// Validates `webvpn` cookies.
    pub cookie_auth: Arc<dyn CookieAuth>,
    /// Supplies addresses, routes and the base MTU per CONNECT.
    pub vpn_info: Arc<dyn VpnInfoSource>,
    /// Inline authentication page handlers.
    pub auth_pages: Arc<dyn AuthPages>,
}

/// Per-connection worker state. Exclusively owned by the worker task;
/// nothing here is shared.
pub struct Worker {
    pub(crate) cfg: Arc<WorkerConfig>,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) tls: Box<dyn StreamChannel>,
    pub(crate) dtls: Option<Box<dyn DatagramChannel>>,
    pub(crate) udp_socket: Option<tokio::net::UdpSocket>,
    pub(crate) tun: Arc<dyn InsideIO>,
    pub(crate) command: CommandChannel,
    pub(crate) dtls_factory: Arc<dyn DtlsSessionFactory>,
    pub(crate) cookie_auth: Arc<dyn CookieAuth>,
    pub(crate) vpn_info: Arc<dyn VpnInfoSource>,
    pub(crate) auth_pages: Arc<dyn AuthPages>,
    pub(crate) auth: AuthState,
    pub(crate) udp_state: UdpState,
    pub(crate) mtu: MtuEstimator,
    pub(crate) tls_mtu: u16,
    pub(crate) dtls_mtu: u16,
    pub(crate) last_dpd: Instant,
    pub(crate) udp_recv_time: Option<Instant>,
    pub(crate) shutdown: ShutdownFlag,
    pub(crate) watchdog: Option<AuthWatchdog>,
}

impl Worker {
    /// Services one client connection to completion, installing the
    /// process signal handlers.
    ///
    /// `Ok(())` is a graceful close; any error is terminal and the
    /// caller is expected to exit non-zero.
    pub async fn run(args: WorkerArgs) -> Result<(), WorkerError> {
        let shutdown = lifecycle::install_signal_handlers().map_err(WorkerError::Setup)?;
        Self::run_with_shutdown(args, shutdown).await
    }

    /// Like [`Worker::run`] for callers that manage signal delivery
    /// themselves.
    pub async fn run_with_shutdown(
        args: WorkerArgs,
        shutdown: ShutdownFlag,
    ) -> Result<(), WorkerError> {
        let WorkerArgs {
            config,
            peer_addr,
            tcp,
            udp,
            tun,
            command,
            tls_acceptor,
            dtls_factory,
            cookie_auth,
            vpn_info,
            auth_pages,
        } = args;

        // The watchdog guards the whole unauthenticated control phase,
        // TLS handshake included.
        let watchdog = (config.auth_timeout > 0)
            .then(|| AuthWatchdog::arm(Duration::from_secs(config.auth_timeout.into())));

        info!(peer = %peer_addr, "accepted connection");
        metrics::connection_accepted();

        let buffer_size = config.udp_buffer_size.as_u64() as usize;
        if buffer_size > 0 {
            let sock = socket2::SockRef::from(&udp);
            sock.set_recv_buffer_size(buffer_size)?;
            sock.set_send_buffer_size(buffer_size)?;
        }

        let tls = tls_acceptor
            .accept(tcp)
            .await
            .map_err(WorkerError::Setup)?;

        let mut worker = Worker {
            cfg: config,
            peer_addr,
            tls,
            dtls: None,
            udp_socket: Some(udp),
            tun,
            command,
            dtls_factory,
            cookie_auth,
            vpn_info,
            auth_pages,
            auth: AuthState::new(),
            udp_state: UdpState::Disabled,
            mtu: MtuEstimator::new(),
            tls_mtu: 0,
            dtls_mtu: 0,
            last_dpd: Instant::now(),
            udp_recv_time: None,
            shutdown,
            watchdog,
        };

        let result = worker.serve().await;
        worker.cleanup(&result).await;
        result
    }

    async fn serve(&mut self) -> Result<(), WorkerError> {
        match self.http_phase().await? {
            http_phase::HttpOutcome::Finished => Ok(()),
            http_phase::HttpOutcome::Tunnel => self.tunnel_loop().await,
        }
    }

    /// Single cleanup path: close both sessions best effort. A peer
    /// that already disconnected gets no parting records.
    async fn cleanup(&mut self, result: &Result<(), WorkerError>) {
        if matches!(result, Err(WorkerError::PeerClosed)) {
            return;
        }

        self.tls.close().await;
        if self.udp_state == UdpState::Active {
            if let Some(dtls) = self.dtls.as_mut() {
                dtls.close().await;
            }
        }
    }
}
