use anyhow::bail;
use bytes::{Buf, BytesMut};

use crate::FRAME_HEADER_LEN;

/// Incremental frame reader for the shared framing: a 2-byte little-endian
/// length `L` followed by `L` bytes of payload.
///
/// Bytes are queued as they arrive from the socket; [`try_next_frame`] yields
/// complete payloads as soon as they are buffered.
///
/// [`try_next_frame`]: Self::try_next_frame
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payload of the next complete frame, or `None` when more
    /// data is needed.
    ///
    /// A zero-length frame is malformed; both protocols always lead the
    /// payload with a packet type.
    pub fn try_next_frame(&mut self) -> anyhow::Result<Option<BytesMut>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;

        if frame_len == 0 {
            bail!("zero-length frame");
        }

        if self.buf.len() - FRAME_HEADER_LEN < frame_len {
            // Not enough data arrived yet.
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(frame_len)))
    }

    /// Whether the decoder is holding a partially received frame. EOF while
    /// this is true means the peer died mid-frame.
    pub fn has_partial_frame(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn queue_bytes(&mut self, bytes: BytesMut) {
        self.buf.unsplit(bytes);
    }

    pub fn queue_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Takes the decoder's spare capacity for use as a read buffer. Queue the
    /// bytes back with [`queue_bytes`](Self::queue_bytes) after reading into
    /// it so the unsplit stays O(1).
    pub fn take_capacity(&mut self) -> BytesMut {
        self.buf.split_off(self.buf.len())
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}
