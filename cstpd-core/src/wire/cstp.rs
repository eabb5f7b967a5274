use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FrameError, PacketType};

/// A CSTP frame as carried in a TLS record.
///
/// Wire format (8 byte header plus payload):
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      'S'      |      'T'      |      'F'      |   version(1)  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         payload length        |      type     |  reserved(0)  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  payload length bytes...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct CstpFrame {
    /// Packet type carried in byte 6.
    pub packet_type: PacketType,
    /// Payload following the header. May be empty.
    pub payload: Bytes,
}

impl CstpFrame {
    /// Fixed header size in bytes.
    pub const HEADER_SIZE: usize = 8;

    const MAGIC: &'static [u8; 3] = b"STF";
    const VERSION: u8 = 0x01;

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

    /// Decodes one frame from a TLS record.
    ///
    /// Record boundaries are assumed to coincide with frame boundaries:
    /// a record holding more or fewer bytes than `8 + length` is
    /// rejected with [`FrameError::BadLength`].
    pub fn try_from_wire(buf: &mut BytesMut) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::TooShort);
        }

        if &buf[..3] != Self::MAGIC || buf[3] != Self::VERSION || buf[7] != 0 {
            return Err(FrameError::BadMagic);
        }

        let claimed = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
        let available = buf.len() - Self::HEADER_SIZE;
        if claimed != available {
            return Err(FrameError::BadLength { claimed, available });
        }

        let packet_type = PacketType::from(buf[6]);
        buf.advance(Self::HEADER_SIZE);
        let payload = buf.copy_to_bytes(claimed);

        Ok(Self {
            packet_type,
            payload,
        })
    }

    /// Appends the framed packet to `buf`.
    pub fn append_to_wire(&self, buf: &mut BytesMut) {
        buf.reserve(Self::HEADER_SIZE + self.payload.len());

        buf.put_slice(Self::MAGIC);
        buf.put_u8(Self::VERSION);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u8(self.packet_type.into());
        buf.put_u8(0);
        buf.put(&self.payload[..]);
    }
}
