//! Outbound half of a stream: slicing, flow control, enqueueing.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{Frame, MAX_DATA_LEN};
use crate::stream::StreamInner;

/// Writes application bytes as data frames onto the session's outbound
/// queue.
///
/// One window slot is taken per data frame *before* the frame is enqueued,
/// so the queue never holds more unacknowledged frames than the peer has
/// room for. Every suspension point is raced against the stream's
/// cancellation token, so a close or teardown always unblocks a writer.
pub(crate) struct SendBuffer {
    inner: Arc<StreamInner>,
}

impl SendBuffer {
    pub(crate) fn new(inner: Arc<StreamInner>) -> Self {
        Self { inner }
    }

    /// Write all of `data`, slicing into frames of at most [`MAX_DATA_LEN`].
    pub(crate) async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        for chunk in data.chunks(MAX_DATA_LEN) {
            self.send_chunk(chunk).await?;
        }
        Ok(data.len())
    }

    /// Write `data` as exactly one data frame.
    pub(crate) async fn write_frame(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                max: MAX_DATA_LEN,
            });
        }
        self.send_chunk(data).await
    }

    async fn send_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.inner.check_writable()?;

        tokio::select! {
            biased;
            _ = self.inner.cancel().cancelled() => {
                return Err(self.inner.write_error());
            }
            _ = self.inner.window().acquire() => {}
        }

        let mut payload = self.inner.pool().acquire();
        payload.extend_from_slice(chunk);
        self.inner
            .enqueue(Frame::Data {
                stream_id: self.inner.id(),
                payload,
            })
            .await
            .map_err(|e| match e {
                // Cancelled mid-enqueue: report the recorded teardown cause.
                Error::StreamClosed => self.inner.write_error(),
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::stream::stream_pair;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn harness(
        window: usize,
    ) -> (Arc<StreamInner>, crate::stream::Stream, mpsc::Receiver<Frame>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (inner, stream) = stream_pair(
            1,
            window,
            out_tx,
            CancellationToken::new(),
            BufferPool::default(),
        );
        (inner, stream, out_rx)
    }

    #[tokio::test]
    async fn test_write_slices_large_payloads() {
        let (inner, _stream, mut out_rx) = harness(8);
        let sb = SendBuffer::new(Arc::clone(&inner));

        let data = vec![0x42u8; MAX_DATA_LEN * 2 + 100];
        assert_eq!(sb.write(&data).await.unwrap(), data.len());

        let mut sizes = Vec::new();
        while let Ok(Frame::Data { payload, .. }) = out_rx.try_recv() {
            sizes.push(payload.len());
        }
        assert_eq!(sizes, vec![MAX_DATA_LEN, MAX_DATA_LEN, 100]);
    }

    #[tokio::test]
    async fn test_each_frame_takes_a_window_slot() {
        let (inner, _stream, _out_rx) = harness(3);
        let sb = SendBuffer::new(Arc::clone(&inner));

        sb.write(&vec![0u8; MAX_DATA_LEN * 2]).await.unwrap();
        assert_eq!(inner.window().available(), 1);
    }

    #[tokio::test]
    async fn test_write_blocks_on_exhausted_window() {
        let (inner, _stream, _out_rx) = harness(1);
        let sb = SendBuffer::new(Arc::clone(&inner));
        sb.write(b"one").await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sb.write(b"two"),
        )
        .await;
        assert!(blocked.is_err(), "write should wait for an ACK");

        inner.window().add(1);
        sb.write(b"two").await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_a_waiting_writer() {
        let (inner, _stream, _out_rx) = harness(1);
        sb_write_then_close(inner).await;
    }

    async fn sb_write_then_close(inner: Arc<StreamInner>) {
        let sb = SendBuffer::new(Arc::clone(&inner));
        sb.write(b"fill").await.unwrap();

        let inner2 = Arc::clone(&inner);
        let closer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            inner2.close_local(None);
        });

        assert!(matches!(sb.write(b"stuck").await, Err(Error::StreamClosed)));
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_frame_rejects_oversized() {
        let (inner, _stream, _out_rx) = harness(4);
        let sb = SendBuffer::new(inner);
        let err = sb.write_frame(&vec![0u8; MAX_DATA_LEN + 1]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadTooLarge { len, max } if len == MAX_DATA_LEN + 1 && max == MAX_DATA_LEN
        ));
    }

    #[tokio::test]
    async fn test_empty_write_sends_nothing() {
        let (inner, _stream, mut out_rx) = harness(4);
        let sb = SendBuffer::new(Arc::clone(&inner));
        assert_eq!(sb.write(b"").await.unwrap(), 0);
        assert!(out_rx.try_recv().is_err());
        assert_eq!(inner.window().available(), 4);
    }
}
