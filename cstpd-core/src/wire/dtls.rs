use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FrameError, PacketType};

/// A tunnel frame as carried in a DTLS datagram.
///
/// One leading type byte; the payload length is implicit from the
/// datagram.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct DtlsFrame {
    /// Packet type carried in byte 0.
    pub packet_type: PacketType,
    /// The rest of the datagram.
    pub payload: Bytes,
}

impl DtlsFrame {
    /// Wire overhead in bytes, does not include the payload itself.
    pub const WIRE_OVERHEAD: usize = 1;

    /// A data frame carrying one IP packet.
    pub fn data(payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::Data,
            payload,
        }
    }

    /// A payloadless control frame.
    pub fn control(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            payload: Bytes::new(),
        }
    }

    /// Decodes one frame from a datagram.
    pub fn try_from_wire(buf: &mut BytesMut) -> Result<Self, FrameError> {
        if buf.is_empty() {
            return Err(FrameError::TooShort);
        }

        let packet_type = PacketType::from(buf.get_u8());
        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            packet_type,
            payload,
        })
    }

    /// Appends the framed packet to `buf`.
    pub fn append_to_wire(&self, buf: &mut BytesMut) {
        buf.reserve(Self::WIRE_OVERHEAD + self.payload.len());

        buf.put_u8(self.packet_type.into());
        buf.put(&self.payload[..]);
    }
}
