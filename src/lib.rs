//! veilmux: an obfuscated stream-multiplexing transport.
//!
//! Many logical streams share one physical connection. Outbound frames from
//! all streams are coalesced into encrypted session frames whose lengths are
//! themselves encrypted, and lone small frames get a random zero-filled
//! tail, so on-the-wire sizes reveal little about the traffic inside.
//!
//! ```text
//!  Stream ─┐                       ┌─ Stream
//!  Stream ─┼─► out queue ─► send   │
//!  Stream ─┘      ▲         task ══╪═══ conn ═══╗
//!                 │ ACK/RST        │            ║
//!            recv task ◄───────────┘    (peer session)
//! ```
//!
//! A [`Session`] runs exactly two tasks over the split connection: the send
//! task drains the shared frame queue, coalesces, pads, encrypts and writes;
//! the receive task reads, decrypts, and dispatches to per-stream buffers.
//! Flow control is a fixed per-stream window of in-flight data frames,
//! replenished by batched ACKs as the reader consumes.
//!
//! Key agreement and connection establishment are out of scope: callers
//! bring an established `AsyncRead + AsyncWrite` transport and a
//! [`CryptoSuite`] with independently derived per-direction keys. A client
//! may additionally supply a one-time opaque [`CLIENT_INIT_SIZE`]-byte block
//! (typically its encrypted key material) which is sent in the clear ahead
//! of the first session frame.
//!
//! # Example
//!
//! ```no_run
//! use veilmux::{BufferPool, CryptoSuite, Session, SessionConfig, SessionMetrics};
//!
//! # async fn run<C>(conn: C) -> veilmux::Result<()>
//! # where
//! #     C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
//! # {
//! let (session, mut acceptor) = Session::start(
//!     conn,
//!     SessionConfig::default(),
//!     CryptoSuite::chacha20_poly1305(&[0u8; 32], &[1u8; 32]),
//!     BufferPool::default(),
//!     SessionMetrics::new(),
//! )?;
//!
//! let mut stream = session.open_stream()?;
//! stream.write(b"hello").await?;
//!
//! while let Some(mut inbound) = acceptor.accept().await {
//!     let mut buf = [0u8; 4096];
//!     let n = inbound.read(&mut buf).await?;
//!     println!("peer opened stream {} with {} bytes", inbound.id(), n);
//! }
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod rtt;
pub mod session;
pub mod stream;

mod receive_buffer;
mod send_buffer;
mod sender;
mod window;

pub use crypto::{CryptoSuite, Decryptor, Encryptor};
pub use error::{Error, Result};
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use pool::{BufferPool, PooledBuf};
pub use protocol::{FrameType, CLIENT_INIT_SIZE, COALESCE_THRESHOLD, MAX_DATA_LEN};
pub use rtt::RttEstimator;
pub use session::{Session, SessionConfig, StreamAcceptor, DEFAULT_MAX_PADDING, DEFAULT_WINDOW_SIZE};
pub use stream::Stream;
