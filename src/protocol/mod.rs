//! Wire protocol: frame types, header layout, size constants, and the
//! inbound session-frame parser.

pub mod wire_format;

pub(crate) mod frame;

pub use wire_format::{
    FrameType, CLIENT_INIT_SIZE, COALESCE_THRESHOLD, DATA_HEADER_SIZE, HEADER_SIZE, LEN_SIZE,
    MAX_CIPHER_OVERHEAD, MAX_DATA_LEN, MAX_FRAME_SIZE, MAX_SESSION_FRAME_SIZE,
};

pub(crate) use frame::{Frame, FrameReader, WireFrame};
