//! Inbound half of a stream: ordered delivery and batched ACKs.

use crate::error::Result;
use crate::pool::PooledBuf;
use crate::protocol::Frame;
use crate::stream::StreamInner;

use tokio::sync::mpsc;

/// Consumes the pooled payload buffers the receive task delivers for one
/// stream, in arrival order.
///
/// Each fully-consumed buffer earns the peer one window slot back. Credits
/// are flushed as a single batched ACK whenever a read call consumes a
/// buffer, plus at the start of the next call for anything left over, so
/// the window replenishes promptly without one ACK frame per tiny frame.
pub(crate) struct ReceiveBuffer {
    rx: mpsc::Receiver<PooledBuf>,
    current: Option<Cursor>,
    pending_acks: u32,
}

struct Cursor {
    buf: PooledBuf,
    pos: usize,
}

impl ReceiveBuffer {
    pub(crate) fn new(rx: mpsc::Receiver<PooledBuf>) -> Self {
        Self {
            rx,
            current: None,
            pending_acks: 0,
        }
    }

    /// Read some bytes into `dst`, waiting when nothing is buffered.
    ///
    /// Returns what the stream core dictates at end of input: `Ok(0)` for a
    /// clean close, the recorded read failure otherwise.
    pub(crate) async fn read(&mut self, inner: &StreamInner, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        self.flush_acks(inner).await;

        loop {
            if let Some(cursor) = &mut self.current {
                let available = &cursor.buf[cursor.pos..];
                let n = available.len().min(dst.len());
                dst[..n].copy_from_slice(&available[..n]);
                cursor.pos += n;
                if cursor.pos == cursor.buf.len() {
                    // Buffer consumed: recycle it and credit the peer.
                    self.current = None;
                    self.pending_acks += 1;
                    self.flush_acks(inner).await;
                }
                return Ok(n);
            }

            // Closing drops the submit handle, so this drains whatever was
            // delivered and then reports end of input.
            match self.rx.recv().await {
                Some(buf) if buf.is_empty() => self.pending_acks += 1,
                Some(buf) => self.current = Some(Cursor { buf, pos: 0 }),
                None => return inner.read_eof(),
            }
        }
    }

    async fn flush_acks(&mut self, inner: &StreamInner) {
        if self.pending_acks == 0 {
            return;
        }
        let frames = std::mem::take(&mut self.pending_acks);
        // A failed enqueue means the session is going away; the credits no
        // longer matter.
        let _ = inner
            .enqueue(Frame::Ack {
                stream_id: inner.id(),
                frames,
            })
            .await;
    }
}
