//! The tunnel negotiator.
//!
//! Turns a cookie-authenticated CONNECT into the data-plane tunnel:
//! validates the request, advertises network parameters and MTUs over
//! the TLS channel, and primes the DTLS state machine when the client
//! offered a premaster.

use std::fmt::Write as _;

use tokio::time::Instant;

use ipnet::IpNet;
use tracing::{debug, error, info};

use cstpd_core::TUNNEL_BUFFER_SIZE;
use cstpd_core::http::Request;
use cstpd_core::session::DtlsResumeParams;

use crate::hooks::CookieAuthResult;
use crate::http_phase::NOT_FOUND;
use crate::{UdpState, Worker, WorkerError, metrics};

const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";
const CONFIG_ERROR: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nX-Reason: Server configuration error\r\n\r\n";

/// Overhead reserved out of the base MTU for the CSTP frame header.
const CSTP_OVERHEAD: u16 = 8;

impl Worker {
    pub(crate) async fn connect_handler(&mut self, req: &Request) -> Result<(), WorkerError> {
        let Some(cookie) = req.cookie else {
            info!("connect request without authentication");
            self.tls.send_all(SERVICE_UNAVAILABLE).await?;
            self.tls.fatal_close().await;
            return Err(WorkerError::ConnectWithoutAuth);
        };

        if !self.auth.auth_ok {
            // No inline authentication happened this session; the
            // cookie is all we have.
            match self.cookie_auth.auth_cookie(&cookie).await {
                CookieAuthResult::Granted => self.auth.auth_ok = true,
                CookieAuthResult::Denied => {
                    info!("failed cookie authentication attempt");
                    metrics::cookie_auth_failed();
                    self.tls.send_all(SERVICE_UNAVAILABLE).await?;
                    self.tls.fatal_close().await;
                    return Err(WorkerError::CookieRejected);
                }
            }
        }
        self.auth.cookie = Some(cookie);

        // Authenticated; the watchdog must never fire from here on.
        self.watchdog = None;

        if req.url != "/CSCOSSLC/tunnel" {
            info!(url = %req.url, "bad connect request");
            self.tls.send_all(NOT_FOUND).await?;
            self.tls.fatal_close().await;
            return Err(WorkerError::BadConnectPath(req.url.clone()));
        }

        if self.cfg.network_name.is_none() {
            error!("no networks are configured; rejecting client");
            self.tls.send_all(CONFIG_ERROR).await?;
            return Err(WorkerError::NoNetworks);
        }

        let Some(vinfo) = self.vpn_info.get_rt_vpn_info().await else {
            error!("no VPN network information; rejecting client");
            self.tls.send_all(CONFIG_ERROR).await?;
            return Err(WorkerError::VpnInfoUnavailable);
        };

        self.udp_state = match req.master_secret {
            Some(master) => {
                self.auth.master_secret = Some(master);
                UdpState::WaitFd
            }
            None => UdpState::Disabled,
        };

        let buffer_size = TUNNEL_BUFFER_SIZE as u16;

        let mut tls_mtu = vinfo.mtu.saturating_sub(CSTP_OVERHEAD);
        if req.cstp_mtu > 0 {
            debug!(mtu = req.cstp_mtu, "peer CSTP MTU");
            tls_mtu = tls_mtu.min(req.cstp_mtu);
        }
        tls_mtu = tls_mtu.min(buffer_size - CSTP_OVERHEAD);

        let mut dtls_mtu = 0u16;
        if self.udp_state != UdpState::Disabled {
            // IP plus the one-byte DTLS frame header. If the client got
            // here over IPv6, assume UDP takes the same path.
            let mtu_overhead: u16 = if self.peer_addr.is_ipv4() { 20 + 1 } else { 40 + 1 };
            dtls_mtu = vinfo.mtu.saturating_sub(mtu_overhead);
            if req.dtls_mtu > 0 {
                debug!(mtu = req.dtls_mtu, "peer DTLS MTU");
                dtls_mtu = dtls_mtu.min(req.dtls_mtu);
            }
            dtls_mtu = dtls_mtu.min(buffer_size - 1);
        }

        let mut resp = String::with_capacity(1024);
        resp.push_str("HTTP/1.1 200 CONNECTED\r\n");
        resp.push_str("X-CSTP-Version: 1\r\n");
        let _ = write!(resp, "X-CSTP-DPD: {}\r\n", self.cfg.dpd);

        if let Some(ipv4) = &vinfo.ipv4 {
            debug!(address = %ipv4.address, "sending IPv4");
            let _ = write!(resp, "X-CSTP-Address: {}\r\n", ipv4.address);
            if let Some(netmask) = ipv4.netmask {
                let _ = write!(resp, "X-CSTP-Netmask: {netmask}\r\n");
            }
            if let Some(dns) = ipv4.dns {
                let _ = write!(resp, "X-CSTP-DNS: {dns}\r\n");
            }
        }

        if let Some(ipv6) = &vinfo.ipv6 {
            debug!(address = %ipv6.address, "sending IPv6");
            let _ = write!(resp, "X-CSTP-Address: {}\r\n", ipv6.address);
            if let Some(prefix) = ipv6.prefix {
                let _ = write!(resp, "X-CSTP-Netmask: {prefix}\r\n");
            }
            if let Some(dns) = ipv6.dns {
                let _ = write!(resp, "X-CSTP-DNS: {dns}\r\n");
            }
        }

        for route in &vinfo.routes {
            debug!(%route, "adding route");
            let _ = write!(resp, "X-CSTP-Split-Include: {}\r\n", split_include(route));
        }

        let _ = write!(resp, "X-CSTP-Keepalive: {}\r\n", self.cfg.keepalive);
        let _ = write!(resp, "X-CSTP-MTU: {tls_mtu}\r\n");

        if self.udp_state != UdpState::Disabled {
            let _ = write!(resp, "X-DTLS-Session-ID: {}\r\n", self.auth.session_id);
            let _ = write!(resp, "X-DTLS-DPD: {}\r\n", self.cfg.dpd);
            let _ = write!(resp, "X-DTLS-Port: {}\r\n", self.cfg.udp_port);
            let _ = write!(
                resp,
                "X-DTLS-Rekey-Time: {}\r\n",
                2 * self.cfg.cookie_validity / 3
            );
            let _ = write!(resp, "X-DTLS-Keepalive: {}\r\n", self.cfg.keepalive);
            let _ = write!(
                resp,
                "X-DTLS-CipherSuite: {}\r\n",
                DtlsResumeParams::CIPHERSUITE
            );
            let _ = write!(resp, "X-DTLS-MTU: {dtls_mtu}\r\n");
        }

        resp.push_str("X-CSTP-Banner: Welcome\r\n\r\n");

        self.tls.send_all(resp.as_bytes()).await?;

        self.tls_mtu = tls_mtu;
        self.dtls_mtu = dtls_mtu;
        self.publish_tun_mtu().await?;

        // Dead peer detection starts counting now.
        self.last_dpd = Instant::now();

        metrics::tunnel_established();
        info!(
            cstp_mtu = tls_mtu,
            dtls = self.udp_state != UdpState::Disabled,
            "tunnel established"
        );
        Ok(())
    }
}

/// `X-CSTP-Split-Include` spells IPv4 routes with a dotted netmask and
/// IPv6 routes with a prefix length.
fn split_include(route: &IpNet) -> String {
    match route {
        IpNet::V4(net) => format!("{}/{}", net.network(), net.netmask()),
        IpNet::V6(net) => format!("{}/{}", net.network(), net.prefix_len()),
    }
}
