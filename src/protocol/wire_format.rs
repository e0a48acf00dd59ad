//! Wire format encoding and decoding.
//!
//! A session frame is the unit of one physical write:
//! ```text
//! ┌────────────────────┬──────────────┬───────────────────────────┐
//! │ CLIENT INIT (256B) │ LENGTH (2B)  │ PAYLOAD (N bytes)         │
//! │ plaintext, first   │ u16 BE, enc. │ encrypted via payload     │
//! │ client frame only  │ via length   │ cipher; one or more       │
//! │                    │ cipher       │ coalesced frames          │
//! └────────────────────┴──────────────┴───────────────────────────┘
//! ```
//!
//! Each embedded frame starts with a 3-byte header:
//! ```text
//! ┌──────────┬──────────────┐
//! │ TYPE (1B)│ STREAM ID    │
//! │          │ 2 bytes BE   │
//! └──────────┴──────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The padding tag is 0 so that a
//! zeroed tail parses as a padding header and terminates frame iteration.

use crate::error::{Error, Result};

/// Frame header size in bytes (type tag + stream ID).
pub const HEADER_SIZE: usize = 3;

/// Session-frame length prefix size.
pub const LEN_SIZE: usize = 2;

/// Data frame header size (frame header + u16 payload length).
pub const DATA_HEADER_SIZE: usize = HEADER_SIZE + LEN_SIZE;

/// ACK body size (u32 acknowledged-frame count).
pub const ACK_BODY_SIZE: usize = 4;

/// Ping/Echo body size (u64 timestamp).
pub const TS_SIZE: usize = 8;

/// Maximum length of data carried in a single data frame.
pub const MAX_DATA_LEN: usize = 8192;

/// Maximum wire size of a single embedded frame.
pub const MAX_FRAME_SIZE: usize = DATA_HEADER_SIZE + MAX_DATA_LEN;

/// Fixed size of the one-time unencrypted client-init payload.
pub const CLIENT_INIT_SIZE: usize = 256;

/// Coalescing threshold: the sender keeps batching while the assembled
/// session frame is below this size, and padding may only be injected below
/// it. Sized to an ethernet-ish MSS so single small frames get obscured.
pub const COALESCE_THRESHOLD: usize = 1448;

/// Worst-case per-message cipher overhead reserved in budget accounting.
pub const MAX_CIPHER_OVERHEAD: usize = 64;

/// Maximum session-frame size. Sized so that admitting one more
/// maximum-size frame while still under [`COALESCE_THRESHOLD`] can never
/// cross this bound.
pub const MAX_SESSION_FRAME_SIZE: usize =
    CLIENT_INIT_SIZE + LEN_SIZE + COALESCE_THRESHOLD + MAX_FRAME_SIZE + MAX_CIPHER_OVERHEAD;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Zero filler, only ever the tail of a session frame. Must be 0 so a
    /// zeroed tail reads as a padding header.
    Padding = 0,
    /// Application payload for one stream.
    Data = 1,
    /// Acknowledgment of a count of received data frames.
    Ack = 2,
    /// Unilateral stream closure.
    Rst = 3,
    /// Keepalive / RTT measurement carrying a timestamp.
    Ping = 4,
    /// Echo of a ping's timestamp.
    Echo = 5,
}

impl FrameType {
    /// Parse a frame type from its wire tag.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Padding),
            1 => Ok(Self::Data),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Rst),
            4 => Ok(Self::Ping),
            5 => Ok(Self::Echo),
            other => Err(Error::UnknownFrameType(other)),
        }
    }

    /// Convert to the wire tag.
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Encode a frame header (type tag + stream ID, Big Endian).
#[inline]
pub fn encode_header(frame_type: FrameType, stream_id: u16) -> [u8; HEADER_SIZE] {
    let id = stream_id.to_be_bytes();
    [frame_type.to_byte(), id[0], id[1]]
}

/// Decode a frame header. The caller guarantees `buf.len() >= HEADER_SIZE`.
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<(FrameType, u16)> {
    debug_assert!(buf.len() >= HEADER_SIZE);
    let frame_type = FrameType::from_byte(buf[0])?;
    let stream_id = u16::from_be_bytes([buf[1], buf[2]]);
    Ok((frame_type, stream_id))
}
