//! Frame representations for the outbound queues and the inbound parser.
//!
//! Outbound, frames travel through the session's channels as [`Frame`] values
//! and are serialized by the sender during coalescing. Inbound, a session
//! frame's payload is fully decrypted before parsing, so [`FrameReader`] is a
//! plain cursor over the plaintext rather than an incremental state machine.

use crate::error::{Error, Result};
use crate::pool::PooledBuf;

use super::wire_format::{
    decode_header, FrameType, ACK_BODY_SIZE, DATA_HEADER_SIZE, HEADER_SIZE, MAX_DATA_LEN, TS_SIZE,
};

/// A frame queued for transmission.
///
/// Padding has no queued representation: it is injected directly by the
/// sender as a zeroed tail.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Application payload for one stream. The buffer returns to the pool
    /// once serialized into a session frame.
    Data { stream_id: u16, payload: PooledBuf },
    /// Acknowledgment of `frames` received data frames.
    Ack { stream_id: u16, frames: u32 },
    /// Unilateral stream closure; header only.
    Rst { stream_id: u16 },
    /// Keepalive ping.
    Ping { ts: u64 },
    /// Echo of a ping's timestamp.
    Echo { ts: u64 },
}

impl Frame {
    /// Bytes this frame contributes to a session frame.
    pub(crate) fn wire_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => DATA_HEADER_SIZE + payload.len(),
            Frame::Ack { .. } => HEADER_SIZE + ACK_BODY_SIZE,
            Frame::Rst { .. } => HEADER_SIZE,
            Frame::Ping { .. } | Frame::Echo { .. } => HEADER_SIZE + TS_SIZE,
        }
    }
}

/// A frame parsed out of a decrypted session-frame payload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WireFrame<'a> {
    Data { stream_id: u16, payload: &'a [u8] },
    Ack { stream_id: u16, frames: u32 },
    Rst { stream_id: u16 },
    Ping { ts: u64 },
    Echo { ts: u64 },
}

/// Cursor over the embedded frames of one decrypted session-frame payload.
///
/// Iteration ends when fewer than [`HEADER_SIZE`] bytes remain or when a
/// padding tag is seen (padding always occupies the tail). A frame truncated
/// *after* a complete non-padding header is a framing error: the wire is
/// desynchronized and the session must be torn down.
pub(crate) struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Parse the next embedded frame, or `None` at the end of the payload.
    pub(crate) fn next_frame(&mut self) -> Result<Option<WireFrame<'a>>> {
        let remaining = self.buf.len() - self.pos;
        if remaining < HEADER_SIZE {
            return Ok(None);
        }

        let (frame_type, stream_id) = decode_header(&self.buf[self.pos..])?;
        if frame_type == FrameType::Padding {
            // Padding is always at the tail, stop processing.
            self.pos = self.buf.len();
            return Ok(None);
        }
        self.pos += HEADER_SIZE;

        let frame = match frame_type {
            FrameType::Padding => unreachable!(),
            FrameType::Rst => WireFrame::Rst { stream_id },
            FrameType::Ack => {
                let body = self.take(ACK_BODY_SIZE, "ACK body")?;
                let frames = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                WireFrame::Ack { stream_id, frames }
            }
            FrameType::Ping | FrameType::Echo => {
                let body = self.take(TS_SIZE, "timestamp")?;
                let ts = u64::from_be_bytes([
                    body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
                ]);
                if frame_type == FrameType::Ping {
                    WireFrame::Ping { ts }
                } else {
                    WireFrame::Echo { ts }
                }
            }
            FrameType::Data => {
                let len_bytes = self.take(super::wire_format::LEN_SIZE, "data length")?;
                let data_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                if data_len > MAX_DATA_LEN {
                    return Err(Error::Protocol(format!(
                        "data frame length {} exceeds maximum {}",
                        data_len, MAX_DATA_LEN
                    )));
                }
                let payload = self.take(data_len, "data payload")?;
                WireFrame::Data { stream_id, payload }
            }
        };
        Ok(Some(frame))
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Protocol(format!(
                "session frame truncated reading {} ({} of {} bytes)",
                what,
                self.buf.len() - self.pos,
                n
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}
