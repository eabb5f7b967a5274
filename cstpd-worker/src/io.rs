//! Tun device IO.

use async_trait::async_trait;
use bytes::BytesMut;

use cstpd_core::session::IOCallbackResult;

/// Read/write of IP packets on the inside of the tunnel.
#[async_trait]
pub trait InsideIO: Send + Sync {
    /// Reads one IP packet, at most `limit` bytes. `Ok` with an empty
    /// buffer means the device reached end of stream.
    async fn recv_buf(&self, limit: usize) -> IOCallbackResult<BytesMut>;

    /// Writes one IP packet, waiting for the device as needed.
    async fn send(&self, buf: &[u8]) -> IOCallbackResult<usize>;
}

/// [`InsideIO`] over the kernel tun device handed over by the
/// supervisor.
pub struct TunDevice {
    dev: tun_rs::AsyncDevice,
}

impl TunDevice {
    /// Wraps an already configured tun handle.
    pub fn new(dev: tun_rs::AsyncDevice) -> Self {
        Self { dev }
    }
}

#[async_trait]
impl InsideIO for TunDevice {
    async fn recv_buf(&self, limit: usize) -> IOCallbackResult<BytesMut> {
        let mut buf = BytesMut::zeroed(limit);
        match self.dev.recv(buf.as_mut()).await {
            Ok(nr) => {
                buf.truncate(nr);
                IOCallbackResult::Ok(buf)
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                IOCallbackResult::WouldBlock
            }
            Err(err) => IOCallbackResult::Err(err),
        }
    }

    async fn send(&self, buf: &[u8]) -> IOCallbackResult<usize> {
        match self.dev.send(buf).await {
            Ok(nr) => IOCallbackResult::Ok(nr),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                IOCallbackResult::WouldBlock
            }
            Err(err) => IOCallbackResult::Err(err),
        }
    }
}
