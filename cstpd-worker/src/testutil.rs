//! In-memory channels and hooks for driving a worker in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use cstpd_core::COOKIE_SIZE;
use cstpd_core::mtu::MtuEstimator;
use cstpd_core::session::{
    DatagramChannel, DatagramSendResult, DtlsResumeParams, HandshakeOutcome, IOCallbackResult,
    StreamChannel,
};

use crate::command::{Command, CommandChannel};
use crate::hooks::{
    AuthContext, AuthPages, CookieAuth, CookieAuthResult, DtlsSessionFactory, HandlerOutcome,
    Ipv4Config, RuntimeVpnInfo, VpnInfoSource,
};
use crate::io::InsideIO;
use crate::lifecycle::ShutdownFlag;
use crate::{AuthState, UdpState, Worker, WorkerConfig};

/// A queue of records with close semantics and readiness notification.
#[derive(Default)]
struct Queue {
    records: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Queue {
    fn push(&self, record: &[u8]) {
        self.records
            .lock()
            .unwrap()
            .push_back(Bytes::copy_from_slice(record));
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pop(&self) -> Option<Bytes> {
        self.records.lock().unwrap().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    // Single-reader: notify_one's stored permit covers the gap between
    // the emptiness check and the await.
    async fn wait(&self) {
        while self.is_empty() && !self.is_closed() {
            self.notify.notified().await;
        }
    }
}

#[derive(Default)]
pub(crate) struct StreamInner {
    incoming: Queue,
    sent: Mutex<Vec<Bytes>>,
    fatal_closed: AtomicBool,
}

/// Test-side handle to a [`MockStream`].
#[derive(Clone)]
pub(crate) struct MockStreamHandle(Arc<StreamInner>);

impl MockStreamHandle {
    /// Queues one decoded TLS record for the worker to read.
    pub fn push(&self, record: &[u8]) {
        self.0.incoming.push(record);
    }

    /// Simulates the peer closing the session.
    pub fn close_incoming(&self) {
        self.0.incoming.close();
    }

    /// Everything the worker wrote, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.0.sent.lock().unwrap().clone()
    }

    pub fn fatally_closed(&self) -> bool {
        self.0.fatal_closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockStream(Arc<StreamInner>);

#[async_trait]
impl StreamChannel for MockStream {
    fn pending(&self) -> bool {
        !self.0.incoming.is_empty()
    }

    async fn readable(&self) -> std::io::Result<()> {
        self.0.incoming.wait().await;
        Ok(())
    }

    fn try_recv(&mut self, buf: &mut BytesMut) -> IOCallbackResult<usize> {
        match self.0.incoming.pop() {
            Some(record) => {
                buf.extend_from_slice(&record);
                IOCallbackResult::Ok(record.len())
            }
            None if self.0.incoming.is_closed() => IOCallbackResult::Ok(0),
            None => IOCallbackResult::WouldBlock,
        }
    }

    async fn send_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.0.sent.lock().unwrap().push(Bytes::copy_from_slice(buf));
        Ok(())
    }

    async fn close(&mut self) {}

    async fn fatal_close(&mut self) {
        self.0.fatal_closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct DatagramInner {
    incoming: Queue,
    sent: Mutex<Vec<Bytes>>,
    max_datagram: Mutex<usize>,
    data_mtu: Mutex<u16>,
    handshake_script: Mutex<VecDeque<HandshakeOutcome>>,
}

impl Default for DatagramInner {
    fn default() -> Self {
        Self {
            incoming: Queue::default(),
            sent: Mutex::new(Vec::new()),
            max_datagram: Mutex::new(usize::MAX),
            data_mtu: Mutex::new(0),
            handshake_script: Mutex::new(VecDeque::new()),
        }
    }
}

/// Test-side handle to a [`MockDatagram`].
#[derive(Clone)]
pub(crate) struct MockDatagramHandle(Arc<DatagramInner>);

impl MockDatagramHandle {
    /// Queues one decoded DTLS datagram for the worker to read.
    pub fn push(&self, record: &[u8]) {
        self.0.incoming.push(record);
    }

    /// Everything the worker sent on the datagram channel, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.0.sent.lock().unwrap().clone()
    }

    /// Datagrams larger than `max` come back as `LargePacket`.
    pub fn set_max_datagram(&self, max: usize) {
        *self.0.max_datagram.lock().unwrap() = max;
    }

    /// The session data MTU last applied by the worker.
    pub fn data_mtu(&self) -> u16 {
        *self.0.data_mtu.lock().unwrap()
    }

    /// Sets the MTU the session will report after its handshake.
    pub fn set_data_mtu(&self, mtu: u16) {
        *self.0.data_mtu.lock().unwrap() = mtu;
    }

    /// Scripts the next outcomes of `step_handshake`. When the script
    /// runs dry the handshake completes.
    pub fn script_handshake(&self, outcome: HandshakeOutcome) {
        self.0.handshake_script.lock().unwrap().push_back(outcome);
    }
}

pub(crate) struct MockDatagram(Arc<DatagramInner>);

#[async_trait]
impl DatagramChannel for MockDatagram {
    fn pending(&self) -> bool {
        !self.0.incoming.is_empty()
    }

    async fn readable(&self) -> std::io::Result<()> {
        self.0.incoming.wait().await;
        Ok(())
    }

    fn try_recv(&mut self, buf: &mut BytesMut) -> IOCallbackResult<usize> {
        match self.0.incoming.pop() {
            Some(record) => {
                buf.extend_from_slice(&record);
                IOCallbackResult::Ok(record.len())
            }
            None => IOCallbackResult::WouldBlock,
        }
    }

    fn try_send(&mut self, buf: &[u8]) -> DatagramSendResult {
        if buf.len() > *self.0.max_datagram.lock().unwrap() {
            return DatagramSendResult::LargePacket;
        }
        self.0.sent.lock().unwrap().push(Bytes::copy_from_slice(buf));
        DatagramSendResult::Sent(buf.len())
    }

    fn step_handshake(&mut self) -> HandshakeOutcome {
        self.0
            .handshake_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HandshakeOutcome::Complete)
    }

    fn set_data_mtu(&mut self, mtu: u16) {
        *self.0.data_mtu.lock().unwrap() = mtu;
    }

    fn data_mtu(&self) -> u16 {
        *self.0.data_mtu.lock().unwrap()
    }

    async fn close(&mut self) {}
}

/// In-memory tun device.
#[derive(Default)]
pub(crate) struct MockTun {
    incoming: Queue,
    written: Mutex<Vec<Bytes>>,
}

impl MockTun {
    /// Queues one IP packet as if it came off the kernel interface.
    pub fn push(&self, packet: &[u8]) {
        self.incoming.push(packet);
    }

    /// Packets the worker delivered to the device.
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl InsideIO for MockTun {
    async fn recv_buf(&self, limit: usize) -> IOCallbackResult<BytesMut> {
        loop {
            if let Some(packet) = self.incoming.pop() {
                let take = packet.len().min(limit);
                return IOCallbackResult::Ok(BytesMut::from(&packet[..take]));
            }
            if self.incoming.is_closed() {
                return IOCallbackResult::Ok(BytesMut::new());
            }
            self.incoming.wait().await;
        }
    }

    async fn send(&self, buf: &[u8]) -> IOCallbackResult<usize> {
        self.written
            .lock()
            .unwrap()
            .push(Bytes::copy_from_slice(buf));
        IOCallbackResult::Ok(buf.len())
    }
}

pub(crate) struct MockCookieAuth {
    grant: AtomicBool,
    last: Mutex<Option<Vec<u8>>>,
}

impl Default for MockCookieAuth {
    fn default() -> Self {
        Self {
            grant: AtomicBool::new(true),
            last: Mutex::new(None),
        }
    }
}

impl MockCookieAuth {
    pub fn deny(&self) {
        self.grant.store(false, Ordering::SeqCst);
    }

    pub fn last_cookie(&self) -> Option<Vec<u8>> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl CookieAuth for MockCookieAuth {
    async fn auth_cookie(&self, cookie: &[u8; COOKIE_SIZE]) -> CookieAuthResult {
        *self.last.lock().unwrap() = Some(cookie.to_vec());
        if self.grant.load(Ordering::SeqCst) {
            CookieAuthResult::Granted
        } else {
            CookieAuthResult::Denied
        }
    }
}

pub(crate) struct MockVpnInfo {
    info: Mutex<Option<RuntimeVpnInfo>>,
}

impl MockVpnInfo {
    fn fixture() -> Self {
        Self {
            info: Mutex::new(Some(RuntimeVpnInfo {
                mtu: 1500,
                ipv4: Some(Ipv4Config {
                    address: "192.0.2.107".parse().unwrap(),
                    netmask: Some("255.255.255.0".parse().unwrap()),
                    dns: Some("192.0.2.1".parse().unwrap()),
                }),
                ipv6: None,
                routes: vec!["10.0.0.0/8".parse().unwrap()],
            })),
        }
    }

    pub fn clear(&self) {
        *self.info.lock().unwrap() = None;
    }
}

#[async_trait]
impl VpnInfoSource for MockVpnInfo {
    async fn get_rt_vpn_info(&self) -> Option<RuntimeVpnInfo> {
        self.info.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub(crate) struct MockPages {
    calls: AtomicUsize,
    last_body: Mutex<Option<Vec<u8>>>,
}

impl MockPages {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<Vec<u8>> {
        self.last_body.lock().unwrap().clone()
    }

    fn record(&self, req: &cstpd_core::http::Request) -> anyhow::Result<HandlerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_body.lock().unwrap() = req.body.as_ref().map(|b| b.to_vec());
        Ok(HandlerOutcome::Reenter)
    }
}

#[async_trait]
impl AuthPages for MockPages {
    async fn get_auth(
        &self,
        req: &cstpd_core::http::Request,
        _ctx: AuthContext<'_>,
    ) -> anyhow::Result<HandlerOutcome> {
        self.record(req)
    }

    async fn post_new_auth(
        &self,
        req: &cstpd_core::http::Request,
        _ctx: AuthContext<'_>,
    ) -> anyhow::Result<HandlerOutcome> {
        self.record(req)
    }

    async fn post_old_auth(
        &self,
        req: &cstpd_core::http::Request,
        _ctx: AuthContext<'_>,
    ) -> anyhow::Result<HandlerOutcome> {
        self.record(req)
    }
}

pub(crate) struct MockDtlsFactory {
    inner: Arc<DatagramInner>,
    last_params: Mutex<Option<DtlsResumeParams>>,
}

impl MockDtlsFactory {
    pub fn last_params(&self) -> Option<DtlsResumeParams> {
        self.last_params.lock().unwrap().take()
    }
}

impl DtlsSessionFactory for MockDtlsFactory {
    fn resume(
        &self,
        params: DtlsResumeParams,
        _socket: tokio::net::UdpSocket,
    ) -> anyhow::Result<Box<dyn DatagramChannel>> {
        *self.last_params.lock().unwrap() = Some(params);
        Ok(Box::new(MockDatagram(self.inner.clone())))
    }
}

/// The supervisor side of the command pipe.
pub(crate) struct SupervisorEnd {
    rx: FramedRead<tokio::io::ReadHalf<DuplexStream>, LengthDelimitedCodec>,
    tx: FramedWrite<tokio::io::WriteHalf<DuplexStream>, LengthDelimitedCodec>,
}

impl SupervisorEnd {
    fn new(stream: DuplexStream) -> Self {
        let (rx, tx) = tokio::io::split(stream);
        Self {
            rx: FramedRead::new(rx, LengthDelimitedCodec::new()),
            tx: FramedWrite::new(tx, LengthDelimitedCodec::new()),
        }
    }

    /// Waits for the next published tun MTU.
    pub async fn recv_tun_mtu(&mut self) -> u32 {
        let record = self.rx.next().await.unwrap().unwrap();
        match Command::try_from_wire(record).unwrap() {
            Command::TunMtu(mtu) => mtu,
            other => panic!("unexpected worker message {other:?}"),
        }
    }

    /// Sends a command to the worker.
    pub async fn send(&mut self, command: Command) {
        let mut buf = BytesMut::new();
        command.append_to_wire(&mut buf);
        self.tx.send(buf.freeze()).await.unwrap();
    }
}

pub(crate) struct TestHandles {
    pub worker: Worker,
    pub tls: MockStreamHandle,
    pub dtls: MockDatagramHandle,
    pub tun: Arc<MockTun>,
    pub supervisor: SupervisorEnd,
    pub cookie_auth: Arc<MockCookieAuth>,
    pub vpn_info: Arc<MockVpnInfo>,
    pub pages: Arc<MockPages>,
    pub dtls_factory: Arc<MockDtlsFactory>,
    pub shutdown: ShutdownFlag,
}

impl TestHandles {
    /// Puts the worker straight into an established DTLS tunnel.
    pub fn activate_dtls(&mut self, dtls_mtu: u16, tls_mtu: u16) {
        self.worker.dtls = Some(Box::new(MockDatagram(self.dtls.0.clone())));
        self.worker.udp_state = UdpState::Active;
        self.worker.dtls_mtu = dtls_mtu;
        self.worker.tls_mtu = tls_mtu;
        self.worker.mtu.seed(dtls_mtu);
        self.worker.udp_recv_time = Some(Instant::now());
    }
}

/// A config with a network attached, as most tests want.
pub(crate) fn test_config() -> WorkerConfig {
    WorkerConfig {
        auth_timeout: 0,
        network_name: Some("default".to_owned()),
        dpd: 60,
        keepalive: 30,
        ..WorkerConfig::default()
    }
}

/// A worker wired to in-memory channels and permissive hooks.
pub(crate) fn test_worker(cfg: WorkerConfig) -> TestHandles {
    let stream_inner = Arc::new(StreamInner::default());
    let dgram_inner = Arc::new(DatagramInner::default());
    let tun = Arc::new(MockTun::default());
    let cookie_auth = Arc::new(MockCookieAuth::default());
    let vpn_info = Arc::new(MockVpnInfo::fixture());
    let pages = Arc::new(MockPages::default());
    let dtls_factory = Arc::new(MockDtlsFactory {
        inner: dgram_inner.clone(),
        last_params: Mutex::new(None),
    });
    let shutdown = ShutdownFlag::new();

    let (ours, theirs) = tokio::io::duplex(4096);

    let worker = Worker {
        cfg: Arc::new(cfg),
        peer_addr: "198.51.100.77:50000".parse().unwrap(),
        tls: Box::new(MockStream(stream_inner.clone())),
        dtls: None,
        udp_socket: None,
        tun: tun.clone(),
        command: CommandChannel::new(ours),
        dtls_factory: dtls_factory.clone(),
        cookie_auth: cookie_auth.clone(),
        vpn_info: vpn_info.clone(),
        auth_pages: pages.clone(),
        auth: AuthState::new(),
        udp_state: UdpState::Disabled,
        mtu: MtuEstimator::new(),
        tls_mtu: 0,
        dtls_mtu: 0,
        last_dpd: Instant::now(),
        udp_recv_time: None,
        shutdown: shutdown.clone(),
        watchdog: None,
    };

    TestHandles {
        worker,
        tls: MockStreamHandle(stream_inner),
        dtls: MockDatagramHandle(dgram_inner),
        tun,
        supervisor: SupervisorEnd::new(theirs),
        cookie_auth,
        vpn_info,
        pages,
        dtls_factory,
        shutdown,
    }
}
