//! The dual-channel data-plane loop.
//!
//! A single cooperative task multiplexes four sources of readiness: the
//! TLS socket, the UDP socket (once the datagram channel is past
//! WAIT_FD), the tun device and the supervisor pipe. Tun packets prefer
//! the DTLS channel and fall back to framed CSTP over TLS; a packet is
//! never dropped because DTLS rejected it. Dead peer detection and the
//! UDP/TLS switch hysteresis run off the wait timeout.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use cstpd_core::TUNNEL_BUFFER_SIZE;
use cstpd_core::session::{
    DatagramChannel, DatagramSendResult, DtlsResumeParams, HandshakeOutcome, IOCallbackResult,
};
use cstpd_core::wire::{CstpFrame, DtlsFrame, PacketType};

use crate::command::Command;
use crate::{UdpState, Worker, WorkerError, metrics};

/// Upper bound on one readiness wait.
const SELECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds of UDP silence before TLS data demotes the datagram channel.
const UDP_SWITCH_TIME: Duration = Duration::from_secs(15);

/// Which channel a packet arrived on (and where its answer goes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelSide {
    Stream,
    Datagram,
}

enum Ready {
    Tun(IOCallbackResult<BytesMut>),
    Tls,
    Udp,
    Command(Option<Command>),
    Timeout,
}

impl Worker {
    pub(crate) async fn tunnel_loop(&mut self) -> Result<(), WorkerError> {
        loop {
            if self.shutdown.is_set() {
                return self.graceful_shutdown().await;
            }

            // Records already decoded inside a session never show up as
            // socket readiness; drain them before waiting.
            let tls_pending = self.tls.pending();
            let dtls_pending = self.dtls.as_ref().is_some_and(|d| d.pending());
            if tls_pending || dtls_pending {
                if tls_pending {
                    self.tls_input().await?;
                }
                if dtls_pending {
                    self.udp_input().await?;
                }
                continue;
            }

            match self.wait_ready().await? {
                Ready::Tun(read) => self.tun_input(read).await?,
                Ready::Tls => self.tls_input().await?,
                Ready::Udp => self.udp_input().await?,
                Ready::Command(command) => self.command_input(command).await?,
                Ready::Timeout => {
                    if self.cfg.dpd > 0
                        && self.last_dpd.elapsed()
                            > Duration::from_secs(3 * u64::from(self.cfg.dpd))
                    {
                        error!("have not received DPD for long");
                        metrics::dpd_timeout();
                        return Err(WorkerError::DpdTimeout);
                    }
                }
            }
        }
    }

    async fn wait_ready(&mut self) -> Result<Ready, WorkerError> {
        let tun_limit = usize::from(if self.udp_state == UdpState::Active {
            self.dtls_mtu
        } else {
            self.tls_mtu
        });
        let udp_wait = self.udp_state > UdpState::WaitFd;

        let tls = self.tls.as_ref();
        let tun = self.tun.as_ref();
        let dtls = self.dtls.as_deref();
        let udp_socket = self.udp_socket.as_ref();
        let command = &mut self.command;

        let ready = tokio::select! {
            read = tun.recv_buf(tun_limit) => Ready::Tun(read),
            r = tls.readable() => {
                r?;
                Ready::Tls
            }
            r = udp_readable(dtls, udp_socket), if udp_wait => {
                r?;
                Ready::Udp
            }
            command = command.recv() => {
                Ready::Command(command.map_err(|_| WorkerError::CommandChannel)?)
            }
            _ = tokio::time::sleep(SELECT_TIMEOUT) => Ready::Timeout,
        };

        Ok(ready)
    }

    /// A packet came off the tun device: prefer DTLS, fall back to a
    /// framed CSTP record on TLS.
    async fn tun_input(&mut self, read: IOCallbackResult<BytesMut>) -> Result<(), WorkerError> {
        let payload = match read {
            IOCallbackResult::WouldBlock => return Ok(()),
            IOCallbackResult::Err(err) => {
                error!(%err, "received corrupt data from tun");
                return Err(WorkerError::Tun(err));
            }
            IOCallbackResult::Ok(buf) if buf.is_empty() => {
                info!("TUN device returned zero");
                return Err(WorkerError::TunClosed);
            }
            IOCallbackResult::Ok(buf) => buf.freeze(),
        };

        trace!(len = payload.len(), "sending tun packet");

        let mut tls_retry = false;
        if self.udp_state == UdpState::Active {
            let mut wire = BytesMut::with_capacity(DtlsFrame::WIRE_OVERHEAD + payload.len());
            DtlsFrame::data(payload.clone()).append_to_wire(&mut wire);

            let outcome = match self.dtls.as_mut() {
                Some(dtls) => dtls.try_send(&wire),
                None => DatagramSendResult::WouldBlock,
            };

            match outcome {
                DatagramSendResult::Sent(sent) => {
                    if let Some(next) = self.mtu.grow(sent, self.dtls_mtu) {
                        metrics::mtu_grown();
                        debug!(mtu = next, "probing larger DTLS MTU");
                        self.set_dtls_mtu(next).await?;
                    }
                }
                DatagramSendResult::LargePacket => {
                    self.shrink_dtls_mtu().await?;
                    debug!(len = payload.len(), "retrying over TLS");
                    tls_retry = true;
                }
                DatagramSendResult::WouldBlock => tls_retry = true,
                DatagramSendResult::Err(err) => return Err(err.into()),
            }
        }

        if self.udp_state != UdpState::Active || tls_retry {
            let mut wire = BytesMut::with_capacity(CstpFrame::HEADER_SIZE + payload.len());
            CstpFrame::data(payload).append_to_wire(&mut wire);
            self.tls.send_all(&wire).await?;
        }

        Ok(())
    }

    /// A record is available on the TLS channel.
    async fn tls_input(&mut self) -> Result<(), WorkerError> {
        let mut buf = BytesMut::with_capacity(TUNNEL_BUFFER_SIZE);
        match self.tls.try_recv(&mut buf) {
            IOCallbackResult::WouldBlock => return Ok(()),
            IOCallbackResult::Err(err) => return Err(err.into()),
            IOCallbackResult::Ok(0) => {
                info!("client disconnected");
                return Err(WorkerError::PeerClosed);
            }
            IOCallbackResult::Ok(n) => trace!(bytes = n, "received TLS record"),
        }

        let frame = CstpFrame::try_from_wire(&mut buf).map_err(|err| {
            info!(%err, "error parsing CSTP data");
            metrics::frame_rejected();
            err
        })?;

        let packet_type = frame.packet_type;
        self.handle_packet(TunnelSide::Stream, packet_type, frame.payload)
            .await?;

        if packet_type == PacketType::Data
            && self.udp_state == UdpState::Active
            && self.udp_silence() > UDP_SWITCH_TIME
        {
            // The client moved its data to TLS; let it be delivered
            // there until UDP traffic shows up again.
            debug!("UDP has been silent, switching to inactive");
            metrics::udp_inactive();
            self.udp_state = UdpState::Inactive;
        }

        Ok(())
    }

    fn udp_silence(&self) -> Duration {
        self.udp_recv_time
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX)
    }

    /// The UDP side is ready; what that means depends on the state.
    async fn udp_input(&mut self) -> Result<(), WorkerError> {
        match self.udp_state {
            UdpState::Active | UdpState::Inactive => self.dtls_input().await,
            UdpState::Setup => self.dtls_setup(),
            UdpState::Handshake => self.dtls_handshake().await,
            UdpState::Disabled | UdpState::WaitFd => Ok(()),
        }
    }

    async fn dtls_input(&mut self) -> Result<(), WorkerError> {
        let mut buf = BytesMut::with_capacity(TUNNEL_BUFFER_SIZE);
        let received = match self.dtls.as_mut() {
            Some(dtls) => dtls.try_recv(&mut buf),
            None => return Ok(()),
        };

        match received {
            IOCallbackResult::Ok(n) if n > 0 => {
                trace!(bytes = n, "received DTLS record");
                if self.udp_state == UdpState::Inactive {
                    debug!("DTLS traffic resumed");
                    metrics::udp_active();
                }
                self.udp_state = UdpState::Active;

                let frame = DtlsFrame::try_from_wire(&mut buf).map_err(|err| {
                    info!(%err, "error parsing DTLS data");
                    metrics::frame_rejected();
                    err
                })?;
                self.handle_packet(TunnelSide::Datagram, frame.packet_type, frame.payload)
                    .await?;
            }
            IOCallbackResult::Ok(_) | IOCallbackResult::WouldBlock => {
                debug!("no data received");
            }
            IOCallbackResult::Err(err) => return Err(err.into()),
        }

        self.udp_recv_time = Some(Instant::now());
        Ok(())
    }

    /// Builds the resumed DTLS session over the attached UDP flow.
    fn dtls_setup(&mut self) -> Result<(), WorkerError> {
        let (Some(socket), Some(premaster)) = (self.udp_socket.take(), self.auth.master_secret)
        else {
            self.udp_state = UdpState::Disabled;
            return Ok(());
        };

        let params = DtlsResumeParams {
            premaster,
            session_id: self.auth.session_id,
        };

        match self.dtls_factory.resume(params, socket) {
            Ok(mut session) => {
                session.set_data_mtu(self.dtls_mtu);
                self.mtu.seed(self.dtls_mtu);
                self.dtls = Some(session);
                self.udp_state = UdpState::Handshake;
                Ok(())
            }
            Err(err) => {
                error!(%err, "could not initialize DTLS session");
                Err(WorkerError::Setup(err))
            }
        }
    }

    /// Advances the resumed handshake, adapting the MTU when a flight
    /// does not fit.
    async fn dtls_handshake(&mut self) -> Result<(), WorkerError> {
        loop {
            let outcome = match self.dtls.as_mut() {
                Some(dtls) => dtls.step_handshake(),
                None => return Ok(()),
            };

            match outcome {
                HandshakeOutcome::InProgress => return Ok(()),
                HandshakeOutcome::Fatal(err) => {
                    error!(%err, "error in DTLS handshake");
                    metrics::dtls_disabled();
                    self.udp_state = UdpState::Disabled;
                    return Ok(());
                }
                HandshakeOutcome::LargePacket => {
                    if self.shrink_dtls_mtu().await? {
                        continue;
                    }
                    debug!("DTLS handshake failed, MTU error");
                    return Ok(());
                }
                HandshakeOutcome::Complete => {
                    let mtu = match self.dtls.as_ref() {
                        Some(dtls) => dtls.data_mtu(),
                        None => return Ok(()),
                    };
                    self.dtls_mtu = mtu;
                    self.mtu.seed(mtu);
                    self.udp_state = UdpState::Active;
                    self.publish_tun_mtu().await?;
                    metrics::dtls_established();
                    debug!(mtu, "DTLS handshake completed");
                    return Ok(());
                }
            }
        }
    }

    async fn command_input(&mut self, command: Option<Command>) -> Result<(), WorkerError> {
        let Some(command) = command else {
            info!("command channel closed");
            return Err(WorkerError::CommandChannel);
        };

        match command {
            Command::AttachUdp => {
                if self.udp_state == UdpState::WaitFd {
                    debug!("supervisor attached the UDP flow");
                    self.udp_state = UdpState::Setup;
                } else {
                    warn!(state = ?self.udp_state, "unexpected UDP attach");
                }
            }
            Command::Terminate => {
                info!("termination requested by supervisor");
                self.shutdown.set();
            }
            Command::TunMtu(_) | Command::Unknown(_) => {
                warn!(?command, "unknown command");
            }
        }

        Ok(())
    }

    async fn handle_packet(
        &mut self,
        side: TunnelSide,
        packet_type: PacketType,
        payload: Bytes,
    ) -> Result<(), WorkerError> {
        match packet_type {
            PacketType::DpdResp => info!("received DPD response"),
            PacketType::Keepalive => info!("received keepalive"),
            PacketType::DpdOut => {
                debug!("received DPD; sending response");
                self.send_dpd_response(side).await?;
                self.last_dpd = Instant::now();
            }
            PacketType::Disconn => info!("received BYE packet"),
            PacketType::Data => {
                trace!(len = payload.len(), "writing to TUN");
                loop {
                    match self.tun.send(&payload).await {
                        IOCallbackResult::Ok(_) => break,
                        IOCallbackResult::WouldBlock => continue,
                        IOCallbackResult::Err(err) => {
                            error!(%err, "could not write data to tun");
                            return Err(WorkerError::Tun(err));
                        }
                    }
                }
            }
            PacketType::TermServer | PacketType::Unknown(_) => {
                debug!(?packet_type, "received unknown packet");
            }
        }

        Ok(())
    }

    /// Answers a dead peer probe on the channel it came in on.
    async fn send_dpd_response(&mut self, side: TunnelSide) -> Result<(), WorkerError> {
        match side {
            TunnelSide::Stream => {
                let mut wire = BytesMut::with_capacity(CstpFrame::HEADER_SIZE);
                CstpFrame::control(PacketType::DpdResp).append_to_wire(&mut wire);
                self.tls.send_all(&wire).await?;
            }
            TunnelSide::Datagram => {
                let mut wire = BytesMut::with_capacity(DtlsFrame::WIRE_OVERHEAD);
                DtlsFrame::control(PacketType::DpdResp).append_to_wire(&mut wire);

                let sent = match self.dtls.as_mut() {
                    Some(dtls) => dtls.try_send(&wire),
                    None => return Ok(()),
                };
                match sent {
                    DatagramSendResult::Sent(_) => {}
                    DatagramSendResult::Err(err) => {
                        error!(%err, "could not send DPD response");
                        return Err(err.into());
                    }
                    DatagramSendResult::LargePacket | DatagramSendResult::WouldBlock => {
                        error!("could not send DPD response");
                        return Err(std::io::Error::other("DPD response rejected").into());
                    }
                }
            }
        }

        Ok(())
    }

    /// Applies a new DTLS data MTU and republishes the tun MTU.
    async fn set_dtls_mtu(&mut self, mtu: u16) -> Result<(), WorkerError> {
        self.dtls_mtu = mtu;
        if let Some(dtls) = self.dtls.as_mut() {
            dtls.set_data_mtu(mtu);
        }
        self.publish_tun_mtu().await
    }

    /// Halves the MTU estimate after an oversized send. Returns `false`
    /// once the estimate became useless and DTLS was disabled.
    async fn shrink_dtls_mtu(&mut self) -> Result<bool, WorkerError> {
        metrics::mtu_shrunk();
        match self.mtu.shrink(self.dtls_mtu) {
            Some(next) => {
                debug!(bad = self.dtls_mtu, mtu = next, "MTU too large, switching down");
                self.set_dtls_mtu(next).await?;
                Ok(true)
            }
            None => {
                info!("could not calculate a valid MTU. Disabling DTLS");
                metrics::dtls_disabled();
                self.udp_state = UdpState::Disabled;
                self.publish_tun_mtu().await?;
                Ok(false)
            }
        }
    }

    /// The tun MTU is the smaller of the two channels, or the TLS MTU
    /// alone while DTLS is down.
    pub(crate) async fn publish_tun_mtu(&mut self) -> Result<(), WorkerError> {
        let mtu = if self.udp_state == UdpState::Disabled || self.dtls_mtu == 0 {
            self.tls_mtu
        } else {
            self.dtls_mtu.min(self.tls_mtu)
        };

        self.command
            .send_tun_mtu(u32::from(mtu))
            .await
            .map_err(|_| WorkerError::CommandChannel)
    }

    /// Best-effort farewell on both channels, then out.
    async fn graceful_shutdown(&mut self) -> Result<(), WorkerError> {
        if self.udp_state == UdpState::Active {
            if let Some(dtls) = self.dtls.as_mut() {
                debug!("sending disconnect message in DTLS channel");
                let mut wire = BytesMut::with_capacity(DtlsFrame::WIRE_OVERHEAD);
                DtlsFrame::control(PacketType::TermServer).append_to_wire(&mut wire);
                let _ = dtls.try_send(&wire);
            }
        }

        debug!("sending disconnect message in TLS channel");
        let mut wire = BytesMut::with_capacity(CstpFrame::HEADER_SIZE);
        CstpFrame::control(PacketType::TermServer).append_to_wire(&mut wire);
        let _ = self.tls.send_all(&wire).await;

        Ok(())
    }
}

async fn udp_readable(
    dtls: Option<&dyn DatagramChannel>,
    socket: Option<&tokio::net::UdpSocket>,
) -> std::io::Result<()> {
    match (dtls, socket) {
        (Some(session), _) => session.readable().await,
        (None, Some(socket)) => socket.readable().await,
        (None, None) => std::future::pending().await,
    }
}
