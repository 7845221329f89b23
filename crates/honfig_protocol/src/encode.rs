use anyhow::ensure;
use bytes::{BufMut, BytesMut};

use crate::{Encode, FRAME_HEADER_LEN, MAX_FRAME_SIZE};

/// Builds outbound frames: each appended packet is prefixed with its 2-byte
/// little-endian payload length.
#[derive(Default)]
pub struct FrameEncoder {
    buf: BytesMut,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one frame containing the packet's id-prefixed payload.
    pub fn append_packet<P>(&mut self, pkt: &P) -> anyhow::Result<()>
    where
        P: Encode + ?Sized,
    {
        let start = self.buf.len();
        self.buf.put_u16_le(0);

        let payload_start = self.buf.len();
        pkt.encode((&mut self.buf).writer())?;

        let payload_len = self.buf.len() - payload_start;
        ensure!(
            payload_len > 0 && payload_len <= MAX_FRAME_SIZE,
            "frame payload of {payload_len} bytes is out of bounds"
        );

        self.buf[start..start + FRAME_HEADER_LEN]
            .copy_from_slice(&(payload_len as u16).to_le_bytes());

        Ok(())
    }

    /// Takes all the frames written so far.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encodes a single packet as one framed byte string.
pub fn encode_frame<P>(pkt: &P) -> anyhow::Result<BytesMut>
where
    P: Encode + ?Sized,
{
    let mut enc = FrameEncoder::new();
    enc.append_packet(pkt)?;
    Ok(enc.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Keepalive;
    use crate::game::ServerAnnounce;
    use crate::{ChatPacket, FrameDecoder, GamePacket};

    #[test]
    fn announce_frame_layout() {
        let frame = encode_frame(&GamePacket::from(ServerAnnounce { port: 10001 })).unwrap();
        assert_eq!(&frame[..], &[0x05, 0x00, 0x40, 0x11, 0x27, 0x00, 0x00]);
    }

    #[test]
    fn keepalive_frame_is_bit_exact() {
        let frame = encode_frame(&ChatPacket::from(Keepalive)).unwrap();
        assert_eq!(&frame[..], &[0x02, 0x00, 0x00, 0x2A]);
    }

    #[test]
    fn encoded_frames_decode_back() {
        let mut enc = FrameEncoder::new();
        enc.append_packet(&GamePacket::from(ServerAnnounce { port: 7 }))
            .unwrap();
        enc.append_packet(&GamePacket::from(ServerAnnounce { port: 8 }))
            .unwrap();

        let mut dec = FrameDecoder::new();
        dec.queue_bytes(enc.take());

        for port in [7, 8] {
            let frame = dec.try_next_frame().unwrap().unwrap();
            let mut r = &frame[..];
            let pkt = crate::Decode::decode(&mut r).unwrap();
            assert_eq!(GamePacket::from(ServerAnnounce { port }), pkt);
        }
    }
}
