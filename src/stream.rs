//! Logical streams multiplexed over one session.
//!
//! A [`Stream`] is the public bidirectional handle. Its shared core,
//! [`StreamInner`], is also held by the session's stream table so the receive
//! task can deliver payloads, replenish the flow-control window, and tear the
//! stream down. The outbound and inbound halves live in
//! [`SendBuffer`](crate::send_buffer::SendBuffer) and
//! [`ReceiveBuffer`](crate::receive_buffer::ReceiveBuffer); `Stream` only
//! delegates.
//!
//! Closure is exactly-once in every direction it can arrive from: a local
//! `close`, an inbound RST, a session-fatal teardown, or dropping the handle.
//! After an RST-style close, reads drain whatever was already buffered and
//! then report EOF; after a session-fatal teardown, both directions report
//! the synthesized per-direction failure instead.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};
use crate::protocol::Frame;
use crate::receive_buffer::ReceiveBuffer;
use crate::send_buffer::SendBuffer;
use crate::window::Window;

/// Per-direction failure delivered to streams when the session dies.
#[derive(Debug, Clone)]
pub(crate) struct StreamFailure {
    pub(crate) read: Error,
    pub(crate) write: Error,
}

impl StreamFailure {
    /// The synthesized condition for session destruction with no more
    /// specific cause, such as an explicit close.
    pub(crate) fn broken_pipe() -> Self {
        Self {
            read: Error::BrokenPipe,
            write: Error::BrokenPipe,
        }
    }
}

/// Outcome of delivering an inbound payload to a stream.
#[derive(Debug)]
pub(crate) enum Submit {
    Delivered,
    /// The stream closed while the frame was in flight; payload dropped.
    Closed,
    /// The peer sent more unacknowledged frames than the advertised window.
    Overflow,
}

struct StreamState {
    /// Inbound delivery handle; dropped on close so the reader sees EOF
    /// after draining.
    rx_submit: Option<mpsc::Sender<PooledBuf>>,
    failure: Option<StreamFailure>,
    closed: bool,
}

/// Shared core of one logical stream.
pub(crate) struct StreamInner {
    id: u16,
    window: Window,
    out: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    pool: BufferPool,
    state: Mutex<StreamState>,
}

impl StreamInner {
    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn window(&self) -> &Window {
        &self.window
    }

    pub(crate) fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().expect("stream lock poisoned").closed
    }

    /// Enqueue a frame onto the session's outbound queue, giving up if the
    /// stream is torn down while waiting for queue space.
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::StreamClosed),
            res = self.out.send(frame) => res.map_err(|_| Error::SessionClosed),
        }
    }

    /// Non-blocking enqueue for paths that cannot await (drop glue).
    pub(crate) fn try_enqueue(&self, frame: Frame) -> bool {
        self.out.try_send(frame).is_ok()
    }

    /// Deliver one inbound payload buffer in arrival order.
    pub(crate) fn submit(&self, payload: PooledBuf) -> Submit {
        let state = self.state.lock().expect("stream lock poisoned");
        match &state.rx_submit {
            None => Submit::Closed,
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => Submit::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => Submit::Overflow,
                Err(mpsc::error::TrySendError::Closed(_)) => Submit::Closed,
            },
        }
    }

    /// Tear the stream down locally. Returns `false` when already closed.
    ///
    /// The first close wins: a later failure never overwrites the recorded
    /// one, so an RST-closed stream keeps reporting clean EOF even if the
    /// session dies afterwards.
    pub(crate) fn close_local(&self, failure: Option<StreamFailure>) -> bool {
        {
            let mut state = self.state.lock().expect("stream lock poisoned");
            if state.closed {
                return false;
            }
            state.closed = true;
            state.failure = failure;
            state.rx_submit = None;
        }
        self.cancel.cancel();
        true
    }

    /// What a read should return once the inbound channel is exhausted.
    pub(crate) fn read_eof(&self) -> Result<usize> {
        let state = self.state.lock().expect("stream lock poisoned");
        match &state.failure {
            Some(f) => Err(f.read.clone()),
            None => Ok(0),
        }
    }

    /// The error a write on a closed stream reports.
    pub(crate) fn write_error(&self) -> Error {
        let state = self.state.lock().expect("stream lock poisoned");
        match &state.failure {
            Some(f) => f.write.clone(),
            None => Error::StreamClosed,
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        let state = self.state.lock().expect("stream lock poisoned");
        if state.closed {
            match &state.failure {
                Some(f) => Err(f.write.clone()),
                None => Err(Error::StreamClosed),
            }
        } else {
            Ok(())
        }
    }
}

/// Build the shared core and the public handle for one stream.
pub(crate) fn stream_pair(
    id: u16,
    window_size: usize,
    out: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    pool: BufferPool,
) -> (Arc<StreamInner>, Stream) {
    let (rx_submit, rx) = mpsc::channel(window_size);
    let inner = Arc::new(StreamInner {
        id,
        window: Window::new(window_size),
        out,
        cancel,
        pool,
        state: Mutex::new(StreamState {
            rx_submit: Some(rx_submit),
            failure: None,
            closed: false,
        }),
    });
    let stream = Stream {
        send: SendBuffer::new(Arc::clone(&inner)),
        recv: ReceiveBuffer::new(rx),
        inner: Arc::clone(&inner),
    };
    (inner, stream)
}

/// One logical bidirectional stream over a session.
pub struct Stream {
    inner: Arc<StreamInner>,
    send: SendBuffer,
    recv: ReceiveBuffer,
}

impl Stream {
    /// Identifier of this stream within its session.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Read some bytes, waiting for data when none is buffered.
    ///
    /// Returns `Ok(0)` at clean EOF (the stream was closed by either side
    /// with an RST); a session-fatal teardown surfaces as the synthesized
    /// read failure instead.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.recv.read(&self.inner, dst).await
    }

    /// Write all of `data`, slicing it into data frames as needed.
    ///
    /// Applies flow control: blocks while the peer's advertised window is
    /// exhausted.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.send.write(data).await
    }

    /// Write `data` as exactly one data frame, preserving its framing on the
    /// wire. Fails with [`Error::PayloadTooLarge`] rather than slicing.
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.send.write_frame(data).await
    }

    /// Close the stream: tears it down locally and notifies the peer with a
    /// single RST. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        // Enqueue the RST before cancelling, or it could never leave.
        let _ = self
            .inner
            .enqueue(Frame::Rst {
                stream_id: self.inner.id,
            })
            .await;
        self.inner.close_local(None);
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            // Best effort: the queue may be full or the session gone.
            let _ = self.inner.try_enqueue(Frame::Rst {
                stream_id: self.inner.id,
            });
            self.inner.close_local(None);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pair(window: usize) -> (Arc<StreamInner>, Stream, mpsc::Receiver<Frame>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (inner, stream) = stream_pair(
            3,
            window,
            out_tx,
            CancellationToken::new(),
            BufferPool::new(64, 4),
        );
        (inner, stream, out_rx)
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_one_rst() {
        let (_inner, mut stream, mut out_rx) = test_pair(4);
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        assert!(matches!(
            out_rx.try_recv(),
            Ok(Frame::Rst { stream_id: 3 })
        ));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_sends_rst() {
        let (inner, stream, mut out_rx) = test_pair(4);
        drop(stream);
        assert!(matches!(
            out_rx.try_recv(),
            Ok(Frame::Rst { stream_id: 3 })
        ));
        assert!(inner.is_closed());
    }

    #[tokio::test]
    async fn test_read_drains_then_eof_after_close() {
        let (inner, mut stream, _out_rx) = test_pair(4);

        let mut payload = inner.pool().acquire();
        payload.extend_from_slice(b"tail");
        assert!(matches!(inner.submit(payload), Submit::Delivered));
        inner.close_local(None);

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_surfaces_on_both_directions() {
        let (inner, mut stream, _out_rx) = test_pair(4);
        inner.close_local(Some(StreamFailure {
            read: Error::BrokenPipe,
            write: Error::BrokenPipe,
        }));

        let mut buf = [0u8; 4];
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(Error::BrokenPipe)
        ));
        assert!(matches!(
            stream.write(b"data").await,
            Err(Error::BrokenPipe)
        ));
    }

    #[tokio::test]
    async fn test_first_close_wins() {
        let (inner, _stream, _out_rx) = test_pair(4);
        assert!(inner.close_local(None));
        assert!(!inner.close_local(Some(StreamFailure {
            read: Error::BrokenPipe,
            write: Error::BrokenPipe,
        })));
        // Still a clean EOF, not the later failure.
        assert!(matches!(inner.read_eof(), Ok(0)));
    }

    #[tokio::test]
    async fn test_submit_overflow_detected() {
        let (inner, _stream, _out_rx) = test_pair(1);
        let mut a = inner.pool().acquire();
        a.extend_from_slice(b"a");
        let mut b = inner.pool().acquire();
        b.extend_from_slice(b"b");

        assert!(matches!(inner.submit(a), Submit::Delivered));
        assert!(matches!(inner.submit(b), Submit::Overflow));
    }
}
