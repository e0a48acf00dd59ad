//! Session: one physical connection, many logical streams.
//!
//! A session owns exactly two persistent tasks:
//!
//! - the **receive task** reads one encrypted session frame at a time,
//!   decrypts it, and dispatches the embedded frames to streams;
//! - the **send task** wakes on queued frames, coalesces whatever else is
//!   ready into one session frame, encrypts it, and performs a single
//!   physical write.
//!
//! Everything else (stream handles, the acceptor) communicates with those
//! two tasks through bounded channels. The stream table and the closed-ID
//! set live under one mutex which is never held across an await.
//!
//! Teardown is exactly-once. Any read or decrypt failure, any write failure,
//! or an explicit `close()` cancels both tasks and fans a cloned
//! per-direction error out to every live stream; with no more specific
//! cause the synthesized condition is a broken pipe in both directions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::{CryptoSuite, Decryptor, Encryptor};
use crate::error::{Error, Result};
use crate::metrics::SessionMetrics;
use crate::pool::{BufferPool, PooledBuf};
use crate::protocol::{
    Frame, FrameReader, WireFrame, CLIENT_INIT_SIZE, LEN_SIZE, MAX_SESSION_FRAME_SIZE,
};
use crate::rtt::RttEstimator;
use crate::sender::Sender;
use crate::stream::{stream_pair, Stream, StreamFailure, StreamInner, Submit};

/// Default flow-control window, in data frames per stream.
pub const DEFAULT_WINDOW_SIZE: usize = 25;

/// Default upper bound (exclusive) on random padding bytes.
pub const DEFAULT_MAX_PADDING: usize = 32;

const DEFAULT_ACCEPT_BACKLOG: usize = 16;
const DEFAULT_OUT_QUEUE_CAPACITY: usize = 256;
const ECHO_QUEUE_CAPACITY: usize = 32;

/// Configuration for one session.
pub struct SessionConfig {
    /// Per-stream flow-control window in data frames. Must be at least 1.
    pub window_size: usize,
    /// Exclusive upper bound on random padding; 0 disables padding.
    pub max_padding: usize,
    /// When set, a keepalive ping is sent at least this often, riding
    /// along with ordinary traffic when there is any.
    pub ping_interval: Option<Duration>,
    /// Client role: an opaque, exactly [`CLIENT_INIT_SIZE`]-byte block sent
    /// unencrypted in front of the first session frame. Servers leave this
    /// unset.
    pub client_init: Option<Bytes>,
    /// How many inbound streams may be queued before `accept` is called.
    pub accept_backlog: usize,
    /// Capacity of the shared outbound frame queue.
    pub out_queue_capacity: usize,
    /// Invoked once, from whichever task closes the session first.
    pub on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_padding: DEFAULT_MAX_PADDING,
            ping_interval: None,
            client_init: None,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            out_queue_capacity: DEFAULT_OUT_QUEUE_CAPACITY,
            on_close: None,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("window_size", &self.window_size)
            .field("max_padding", &self.max_padding)
            .field("ping_interval", &self.ping_interval)
            .field("client_init", &self.client_init.as_ref().map(Bytes::len))
            .field("accept_backlog", &self.accept_backlog)
            .field("out_queue_capacity", &self.out_queue_capacity)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

struct StreamTable {
    live: HashMap<u16, Arc<StreamInner>>,
    /// IDs that have been torn down. Never resurrected: late frames for
    /// these are dropped and the IDs are skipped on allocation.
    closed: HashSet<u16>,
    next_id: u16,
}

struct Shared {
    out_tx: mpsc::Sender<Frame>,
    echo_tx: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<Stream>,
    streams: Mutex<StreamTable>,
    cancel: CancellationToken,
    closed: AtomicBool,
    loops: AtomicUsize,
    pool: BufferPool,
    metrics: SessionMetrics,
    rtt: RttEstimator,
    epoch: Instant,
    window_size: usize,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Shared {
    /// Timestamp for ping/echo frames: nanoseconds since this session's
    /// epoch. Only ever compared against itself.
    fn now_ts(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn build_stream(&self, id: u16) -> (Arc<StreamInner>, Stream) {
        stream_pair(
            id,
            self.window_size,
            self.out_tx.clone(),
            self.cancel.child_token(),
            self.pool.clone(),
        )
    }

    /// Remove streams whose RSTs just hit the wire (or whose peer will
    /// never hear from them again) and mark their IDs as spent.
    fn retire_streams(&self, ids: &[u16]) {
        let removed: Vec<_> = {
            let mut table = self.streams.lock().expect("session lock poisoned");
            ids.iter()
                .filter_map(|id| {
                    table.closed.insert(*id);
                    table.live.remove(id)
                })
                .collect()
        };
        for inner in removed {
            inner.close_local(None);
        }
    }

    fn on_session_error(&self, read: Option<Error>, write: Option<Error>) {
        let failure = StreamFailure {
            read: read.unwrap_or(Error::BrokenPipe),
            write: write.unwrap_or(Error::BrokenPipe),
        };
        tracing::debug!(read = %failure.read, write = %failure.write, "session torn down");
        let _ = self.close_with(Some(failure));
    }

    fn close_with(&self, failure: Option<StreamFailure>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        self.metrics.session_closing();

        let live: Vec<_> = {
            let mut table = self.streams.lock().expect("session lock poisoned");
            table.live.drain().map(|(_, inner)| inner).collect()
        };
        for inner in live {
            inner.close_local(failure.clone());
        }

        self.cancel.cancel();
        if let Some(hook) = self
            .on_close
            .lock()
            .expect("session lock poisoned")
            .take()
        {
            hook();
        }
        Ok(())
    }
}

/// Handle for one multiplexed session.
///
/// Dropping the handle closes the session.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Split `conn` and spawn the session's receive and send tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C>(
        conn: C,
        mut config: SessionConfig,
        crypto: CryptoSuite,
        pool: BufferPool,
        metrics: SessionMetrics,
    ) -> Result<(Session, StreamAcceptor)>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if config.window_size == 0 {
            return Err(Error::Config("window_size must be at least 1".to_string()));
        }
        if let Some(init) = &config.client_init {
            if init.len() != CLIENT_INIT_SIZE {
                return Err(Error::Config(format!(
                    "client init must be exactly {} bytes, got {}",
                    CLIENT_INIT_SIZE,
                    init.len()
                )));
            }
        }

        let (out_tx, out_rx) = mpsc::channel(config.out_queue_capacity);
        let (echo_tx, echo_rx) = mpsc::channel(ECHO_QUEUE_CAPACITY);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let shared = Arc::new(Shared {
            out_tx,
            echo_tx,
            accept_tx,
            streams: Mutex::new(StreamTable {
                live: HashMap::new(),
                closed: HashSet::new(),
                next_id: 0,
            }),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            loops: AtomicUsize::new(2),
            pool,
            metrics: metrics.clone(),
            rtt: RttEstimator::default(),
            epoch: Instant::now(),
            window_size: config.window_size,
            on_close: Mutex::new(config.on_close.take()),
        });

        metrics.session_opened();
        metrics.recv_loop_started();
        metrics.send_loop_started();

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(recv_driver(Arc::clone(&shared), reader, crypto.decryptor));
        tokio::spawn(send_driver(
            Arc::clone(&shared),
            writer,
            crypto.encryptor,
            out_rx,
            echo_rx,
            SendSettings {
                max_padding: config.max_padding,
                ping_interval: config.ping_interval,
                client_init: config.client_init.take(),
            },
        ));

        let acceptor = StreamAcceptor {
            rx: accept_rx,
            cancel: shared.cancel.clone(),
        };
        Ok((Session { shared }, acceptor))
    }

    /// Open a new outbound stream on the next free ID.
    ///
    /// Live and already-torn-down IDs are skipped; when the whole 16-bit
    /// space is spent this fails with [`Error::IdsExhausted`].
    pub fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let mut table = self.shared.streams.lock().expect("session lock poisoned");
        let mut candidate = table.next_id;
        let mut id = None;
        for _ in 0..=u16::MAX as u32 {
            if !table.live.contains_key(&candidate) && !table.closed.contains(&candidate) {
                id = Some(candidate);
                break;
            }
            candidate = candidate.wrapping_add(1);
        }
        let id = id.ok_or(Error::IdsExhausted)?;

        let (inner, stream) = self.shared.build_stream(id);
        table.live.insert(id, inner);
        table.next_id = id.wrapping_add(1);
        Ok(stream)
    }

    /// Current round-trip estimate, fed by ping/echo exchanges.
    pub fn rtt(&self) -> Option<Duration> {
        self.shared.rtt.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the session: cancels both tasks, drops the connection halves,
    /// and fails every live stream with [`Error::BrokenPipe`] in both
    /// directions. The first caller gets `Ok`; later callers get
    /// [`Error::SessionClosed`].
    pub fn close(&self) -> Result<()> {
        self.shared.close_with(Some(StreamFailure::broken_pipe()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.close_with(Some(StreamFailure::broken_pipe()));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receives streams the peer opened.
#[derive(Debug)]
pub struct StreamAcceptor {
    rx: mpsc::Receiver<Stream>,
    cancel: CancellationToken,
}

impl StreamAcceptor {
    /// Wait for the next inbound stream; `None` once the session is closed.
    pub async fn accept(&mut self) -> Option<Stream> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            stream = self.rx.recv() => stream,
        }
    }
}

enum LoopKind {
    Recv,
    Send,
}

/// Keeps the loop counters honest no matter how a task exits. The last
/// task out records the session as fully closed.
struct LoopGuard {
    shared: Arc<Shared>,
    kind: LoopKind,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        match self.kind {
            LoopKind::Recv => self.shared.metrics.recv_loop_stopped(),
            LoopKind::Send => self.shared.metrics.send_loop_stopped(),
        }
        if self.shared.loops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.metrics.session_closed();
        }
    }
}

async fn recv_driver<R>(shared: Arc<Shared>, mut reader: R, mut dec: Box<dyn Decryptor>)
where
    R: AsyncRead + Send + Unpin,
{
    let _guard = LoopGuard {
        shared: Arc::clone(&shared),
        kind: LoopKind::Recv,
    };
    if let Err(e) = recv_loop(&shared, &mut reader, dec.as_mut()).await {
        shared.on_session_error(Some(e), None);
    }
}

async fn recv_loop<R>(shared: &Arc<Shared>, reader: &mut R, dec: &mut dyn Decryptor) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    let mut frame_buf = vec![0u8; MAX_SESSION_FRAME_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            res = reader.read_exact(&mut len_buf) => { res?; }
        }
        dec.decrypt_length(&mut len_buf);
        let n = u16::from_be_bytes(len_buf) as usize;
        if n > frame_buf.len() {
            return Err(Error::Protocol(format!(
                "session frame length {} exceeds maximum {}",
                n,
                frame_buf.len()
            )));
        }

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            res = reader.read_exact(&mut frame_buf[..n]) => { res?; }
        }
        let plaintext = dec.decrypt_payload(&mut frame_buf[..n])?;
        dispatch(shared, plaintext).await?;
    }
}

async fn dispatch(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let mut reader = FrameReader::new(payload);
    while let Some(frame) = reader.next_frame()? {
        match frame {
            WireFrame::Data { stream_id, payload } => {
                dispatch_data(shared, stream_id, payload).await?;
            }
            WireFrame::Ack { stream_id, frames } => {
                let target = {
                    let table = shared.streams.lock().expect("session lock poisoned");
                    table.live.get(&stream_id).cloned()
                };
                match target {
                    Some(inner) => inner.window().add(frames),
                    None => tracing::trace!(stream_id, "ACK for unknown stream ignored"),
                }
            }
            WireFrame::Rst { stream_id } => {
                // Local close only. Answering an RST with an RST would ping-pong.
                let removed = {
                    let mut table = shared.streams.lock().expect("session lock poisoned");
                    table.closed.insert(stream_id);
                    table.live.remove(&stream_id)
                };
                if let Some(inner) = removed {
                    inner.close_local(None);
                }
            }
            WireFrame::Ping { ts } => {
                let _ = shared.echo_tx.send(Frame::Echo { ts }).await;
            }
            WireFrame::Echo { ts } => {
                let now = shared.now_ts();
                if now > ts {
                    shared.rtt.update(Duration::from_nanos(now - ts));
                }
            }
        }
    }
    Ok(())
}

async fn dispatch_data(shared: &Arc<Shared>, stream_id: u16, payload: &[u8]) -> Result<()> {
    let mut buf = shared.pool.acquire();
    buf.extend_from_slice(payload);

    enum Route {
        Existing(Arc<StreamInner>),
        Fresh(Arc<StreamInner>, Stream),
        Stale,
    }

    let route = {
        let mut table = shared.streams.lock().expect("session lock poisoned");
        if let Some(inner) = table.live.get(&stream_id) {
            Route::Existing(Arc::clone(inner))
        } else if table.closed.contains(&stream_id) {
            Route::Stale
        } else {
            let (inner, stream) = shared.build_stream(stream_id);
            table.live.insert(stream_id, Arc::clone(&inner));
            Route::Fresh(inner, stream)
        }
    };

    match route {
        Route::Stale => {
            tracing::trace!(stream_id, "data for torn-down stream dropped");
        }
        Route::Existing(inner) => deliver(stream_id, &inner, buf)?,
        Route::Fresh(inner, stream) => {
            deliver(stream_id, &inner, buf)?;
            let accepted = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => false,
                res = shared.accept_tx.send(stream) => res.is_ok(),
            };
            if !accepted {
                // Nobody will ever accept it; the dropped handle's RST glue
                // informs the peer, this just retires the table entry.
                shared.retire_streams(&[stream_id]);
            }
        }
    }
    Ok(())
}

fn deliver(stream_id: u16, inner: &StreamInner, buf: PooledBuf) -> Result<()> {
    match inner.submit(buf) {
        Submit::Delivered => Ok(()),
        // Racing a local close; the payload is gone either way.
        Submit::Closed => Ok(()),
        Submit::Overflow => Err(Error::Protocol(format!(
            "stream {stream_id} exceeded its receive window"
        ))),
    }
}

struct SendSettings {
    max_padding: usize,
    ping_interval: Option<Duration>,
    client_init: Option<Bytes>,
}

enum Wake {
    Cancelled,
    Ping,
    Frame(Frame),
}

async fn send_driver<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut enc: Box<dyn Encryptor>,
    mut out_rx: mpsc::Receiver<Frame>,
    mut echo_rx: mpsc::Receiver<Frame>,
    settings: SendSettings,
) where
    W: AsyncWrite + Send + Unpin,
{
    let _guard = LoopGuard {
        shared: Arc::clone(&shared),
        kind: LoopKind::Send,
    };
    match send_loop(
        &shared,
        &mut writer,
        enc.as_mut(),
        &mut out_rx,
        &mut echo_rx,
        settings,
    )
    .await
    {
        Ok(()) => {
            let _ = writer.shutdown().await;
        }
        Err(e) => shared.on_session_error(None, Some(e)),
    }
}

async fn send_loop<W>(
    shared: &Arc<Shared>,
    writer: &mut W,
    enc: &mut dyn Encryptor,
    out_rx: &mut mpsc::Receiver<Frame>,
    echo_rx: &mut mpsc::Receiver<Frame>,
    mut settings: SendSettings,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
    let overhead = enc.overhead();
    let mut next_ping = settings
        .ping_interval
        .map(|i| tokio::time::Instant::now() + i);

    loop {
        let first = match next_work(shared, echo_rx, out_rx, next_ping).await {
            Wake::Cancelled => return Ok(()),
            Wake::Ping => {
                next_ping = settings
                    .ping_interval
                    .map(|i| tokio::time::Instant::now() + i);
                Frame::Ping {
                    ts: shared.now_ts(),
                }
            }
            Wake::Frame(frame) => frame,
        };

        let mut sender = Sender::new(&mut buf, settings.client_init.as_deref(), overhead);
        settings.client_init = None;
        sender.buffer_frame(first);
        sender.drain(echo_rx, out_rx);

        // Sustained traffic never lets the timer arm fire, so an overdue
        // keepalive rides along in whatever batch is going out anyway. The
        // deadline moves only when a ping is actually buffered.
        if let (Some(interval), Some(at)) = (settings.ping_interval, next_ping) {
            if tokio::time::Instant::now() >= at {
                let ping = Frame::Ping {
                    ts: shared.now_ts(),
                };
                if sender.fits(ping.wire_len()) {
                    sender.buffer_frame(ping);
                    next_ping = Some(tokio::time::Instant::now() + interval);
                }
            }
        }

        sender.maybe_pad(settings.max_padding)?;

        let (wire, closed_ids) = sender.finish(enc);
        // Raced against cancellation so a stalled peer cannot pin this task
        // in the write after a close.
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(()),
            res = writer.write_all(wire) => res?,
        }

        if !closed_ids.is_empty() {
            shared.retire_streams(&closed_ids);
        }
    }
}

/// Wait for something to do. Echoes outrank ordinary frames so a loaded
/// session still answers pings promptly.
async fn next_work(
    shared: &Arc<Shared>,
    echo_rx: &mut mpsc::Receiver<Frame>,
    out_rx: &mut mpsc::Receiver<Frame>,
    ping_at: Option<tokio::time::Instant>,
) -> Wake {
    match ping_at {
        Some(at) => tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Wake::Cancelled,
            frame = echo_rx.recv() => frame.map_or(Wake::Cancelled, Wake::Frame),
            frame = out_rx.recv() => frame.map_or(Wake::Cancelled, Wake::Frame),
            _ = tokio::time::sleep_until(at) => Wake::Ping,
        },
        None => tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Wake::Cancelled,
            frame = echo_rx.recv() => frame.map_or(Wake::Cancelled, Wake::Frame),
            frame = out_rx.recv() => frame.map_or(Wake::Cancelled, Wake::Frame),
        },
    }
}
