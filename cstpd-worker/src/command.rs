//! The command channel to the supervisor.
//!
//! Length-delimited records over an in-process pipe, one tag byte plus
//! payload each. The worker publishes tun MTU changes outbound and
//! consumes a small set of inbound messages; unknown tags are logged by
//! the dispatcher and skipped.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Messages exchanged with the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// The effective tun MTU changed (worker to supervisor).
    TunMtu(u32),
    /// The client's UDP flow reached the supervisor; the worker may
    /// bring up DTLS (supervisor to worker).
    AttachUdp,
    /// Tear the connection down gracefully (supervisor to worker).
    Terminate,
    /// A message this build does not understand. Carried so the
    /// dispatcher can log the tag.
    Unknown(u8),
}

#[derive(Copy, Clone, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum Tag {
    TunMtu = 1,
    AttachUdp = 2,
    Terminate = 3,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Command {
    pub(crate) fn try_from_wire(mut buf: BytesMut) -> io::Result<Self> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty command record",
            ));
        }

        match Tag::from(buf.get_u8()) {
            Tag::TunMtu => {
                if buf.remaining() < 4 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "short tun MTU record",
                    ));
                }
                Ok(Command::TunMtu(buf.get_u32()))
            }
            Tag::AttachUdp => Ok(Command::AttachUdp),
            Tag::Terminate => Ok(Command::Terminate),
            Tag::Unknown(tag) => Ok(Command::Unknown(tag)),
        }
    }

    pub(crate) fn append_to_wire(&self, buf: &mut BytesMut) {
        match self {
            Command::TunMtu(mtu) => {
                buf.put_u8(Tag::TunMtu.into());
                buf.put_u32(*mtu);
            }
            Command::AttachUdp => buf.put_u8(Tag::AttachUdp.into()),
            Command::Terminate => buf.put_u8(Tag::Terminate.into()),
            Command::Unknown(tag) => buf.put_u8(*tag),
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The worker's end of the supervisor pipe.
pub struct CommandChannel {
    rx: FramedRead<BoxedRead, LengthDelimitedCodec>,
    tx: FramedWrite<BoxedWrite, LengthDelimitedCodec>,
}

impl CommandChannel {
    /// Wraps the pipe endpoint handed over at spawn time.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rx, tx) = tokio::io::split(stream);
        Self {
            rx: FramedRead::new(Box::new(rx), LengthDelimitedCodec::new()),
            tx: FramedWrite::new(Box::new(tx), LengthDelimitedCodec::new()),
        }
    }

    /// Receives the next supervisor message. `Ok(None)` means the
    /// supervisor closed its end. Cancel safe.
    pub async fn recv(&mut self) -> io::Result<Option<Command>> {
        match self.rx.next().await {
            None => Ok(None),
            Some(Err(err)) => Err(err),
            Some(Ok(record)) => Command::try_from_wire(record).map(Some),
        }
    }

    /// Publishes the effective tun MTU.
    pub async fn send_tun_mtu(&mut self, mtu: u32) -> io::Result<()> {
        let mut buf = BytesMut::new();
        Command::TunMtu(mtu).append_to_wire(&mut buf);
        self.tx.send(buf.freeze()).await
    }
}
