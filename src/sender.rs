//! Per-write coalescing of queued frames into one session frame.

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;

use crate::crypto::Encryptor;
use crate::error::{Error, Result};
use crate::protocol::wire_format::encode_header;
use crate::protocol::{
    Frame, FrameType, CLIENT_INIT_SIZE, COALESCE_THRESHOLD, LEN_SIZE, MAX_FRAME_SIZE,
};

/// Assembles one session frame in the send task's reusable buffer.
///
/// A fresh `Sender` is built per wakeup of the send task. It serializes the
/// frame that woke the task, drains whatever else is immediately ready
/// (echoes first) while the budget allows, optionally pads, then encrypts
/// and hands back the complete wire image for a single physical write.
///
/// RST frames contribute their header and additionally record the stream ID:
/// the stream table must not be touched until the RST is actually on the
/// wire, so cleanup is deferred to after the write.
pub(crate) struct Sender<'a> {
    buf: &'a mut [u8],
    /// Offset where frame data begins: past the length slot and, on the
    /// first client write, past the plaintext client-init block.
    start: usize,
    /// Frame bytes serialized so far.
    len: usize,
    coalesced: usize,
    overhead: usize,
    closed_streams: Vec<u16>,
}

impl<'a> Sender<'a> {
    /// `buf` must be `MAX_SESSION_FRAME_SIZE` bytes. `client_init`, when
    /// present, must be exactly `CLIENT_INIT_SIZE` bytes (validated at
    /// session construction) and is emitted unencrypted before everything
    /// else.
    pub(crate) fn new(buf: &'a mut [u8], client_init: Option<&[u8]>, overhead: usize) -> Self {
        let start = match client_init {
            Some(init) => {
                debug_assert_eq!(init.len(), CLIENT_INIT_SIZE);
                buf[..CLIENT_INIT_SIZE].copy_from_slice(init);
                CLIENT_INIT_SIZE + LEN_SIZE
            }
            None => LEN_SIZE,
        };
        Self {
            buf,
            start,
            len: 0,
            coalesced: 0,
            overhead,
            closed_streams: Vec::new(),
        }
    }

    fn under_threshold(&self) -> bool {
        self.len < COALESCE_THRESHOLD
    }

    /// Whether one more frame of any size fits. Conservative: assumes the
    /// worst-case frame plus the cipher overhead.
    fn has_room(&self) -> bool {
        self.fits(MAX_FRAME_SIZE)
    }

    /// Whether `extra` more bytes fit alongside the cipher overhead.
    pub(crate) fn fits(&self, extra: usize) -> bool {
        self.start + self.len + extra + self.overhead <= self.buf.len()
    }

    /// Serialize one frame at the current position.
    pub(crate) fn buffer_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Data { stream_id, payload } => {
                self.put(&encode_header(FrameType::Data, stream_id));
                self.put(&(payload.len() as u16).to_be_bytes());
                self.put(&payload);
                // `payload` drops here and returns to the pool.
            }
            Frame::Ack { stream_id, frames } => {
                self.put(&encode_header(FrameType::Ack, stream_id));
                self.put(&frames.to_be_bytes());
            }
            Frame::Rst { stream_id } => {
                self.put(&encode_header(FrameType::Rst, stream_id));
                self.closed_streams.push(stream_id);
            }
            Frame::Ping { ts } => {
                self.put(&encode_header(FrameType::Ping, 0));
                self.put(&ts.to_be_bytes());
            }
            Frame::Echo { ts } => {
                self.put(&encode_header(FrameType::Echo, 0));
                self.put(&ts.to_be_bytes());
            }
        }
        self.coalesced += 1;
    }

    fn put(&mut self, bytes: &[u8]) {
        let at = self.start + self.len;
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Pull in whatever is immediately ready, echoes before ordinary
    /// frames, until nothing is pending or the budget is spent.
    pub(crate) fn drain(
        &mut self,
        echo_rx: &mut mpsc::Receiver<Frame>,
        out_rx: &mut mpsc::Receiver<Frame>,
    ) {
        while self.under_threshold() && self.has_room() {
            let frame = match echo_rx.try_recv() {
                Ok(f) => f,
                Err(_) => match out_rx.try_recv() {
                    Ok(f) => f,
                    Err(_) => break,
                },
            };
            self.buffer_frame(frame);
        }
    }

    /// Append a random zero tail when exactly one frame was coalesced and
    /// the session frame is still small.
    ///
    /// Lone small frames are the traffic-analysis tell (a keystroke, a bare
    /// ACK); batched writes already have irregular sizes.
    pub(crate) fn maybe_pad(&mut self, max_padding: usize) -> Result<()> {
        if self.coalesced != 1 || max_padding == 0 || !self.under_threshold() {
            return Ok(());
        }
        let mut raw = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|e| Error::RandomSource(e.to_string()))?;
        let pad = (u64::from_be_bytes(raw) % max_padding as u64) as usize;
        let at = self.start + self.len;
        self.buf[at..at + pad].fill(0);
        self.len += pad;
        Ok(())
    }

    /// Encrypt the assembled payload in place, prefix the encrypted length,
    /// and return the wire image plus the stream IDs whose RSTs it carries.
    pub(crate) fn finish(self, enc: &mut dyn Encryptor) -> (&'a [u8], Vec<u16>) {
        let written = enc.encrypt_payload(&mut self.buf[self.start..], self.len);
        let len_at = self.start - LEN_SIZE;
        self.buf[len_at..self.start].copy_from_slice(&(written as u16).to_be_bytes());
        enc.encrypt_length(&mut self.buf[len_at..self.start]);
        (&self.buf[..self.start + written], self.closed_streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoSuite;
    use crate::pool::BufferPool;
    use crate::protocol::{FrameReader, WireFrame, MAX_DATA_LEN, MAX_SESSION_FRAME_SIZE};

    fn data_frame(pool: &BufferPool, stream_id: u16, data: &[u8]) -> Frame {
        let mut payload = pool.acquire();
        payload.extend_from_slice(data);
        Frame::Data { stream_id, payload }
    }

    /// Strip the plaintext length prefix and parse the payload.
    fn parse(wire: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let n = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(wire.len(), LEN_SIZE + n);
        let mut reader = FrameReader::new(&wire[LEN_SIZE..]);
        let mut out = Vec::new();
        while let Some(f) = reader.next_frame().unwrap() {
            if let WireFrame::Data { stream_id, payload } = f {
                out.push((stream_id, payload.to_vec()));
            }
        }
        out
    }

    #[test]
    fn test_single_data_frame_image() {
        let pool = BufferPool::default();
        let mut suite = CryptoSuite::plaintext();
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];

        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 5, b"hello"));
        let (wire, closed) = sender.finish(suite.encryptor.as_mut());

        assert!(closed.is_empty());
        assert_eq!(parse(wire), vec![(5, b"hello".to_vec())]);
    }

    #[test]
    fn test_client_init_prefixes_wire_image() {
        let pool = BufferPool::default();
        let mut suite = CryptoSuite::plaintext();
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let init = [0xC1u8; CLIENT_INIT_SIZE];

        let mut sender = Sender::new(&mut buf, Some(&init), 0);
        sender.buffer_frame(data_frame(&pool, 1, b"x"));
        let (wire, _) = sender.finish(suite.encryptor.as_mut());

        assert_eq!(&wire[..CLIENT_INIT_SIZE], &init[..]);
        let body_len =
            u16::from_be_bytes([wire[CLIENT_INIT_SIZE], wire[CLIENT_INIT_SIZE + 1]]) as usize;
        assert_eq!(wire.len(), CLIENT_INIT_SIZE + LEN_SIZE + body_len);
    }

    #[tokio::test]
    async fn test_drain_polls_echo_queue_first() {
        let pool = BufferPool::default();
        let mut suite = CryptoSuite::plaintext();
        let (echo_tx, mut echo_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        out_tx.try_send(data_frame(&pool, 2, b"late")).unwrap();
        echo_tx.try_send(Frame::Echo { ts: 42 }).unwrap();

        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 1, b"first"));
        sender.drain(&mut echo_rx, &mut out_rx);
        let (wire, _) = sender.finish(suite.encryptor.as_mut());

        let mut reader = FrameReader::new(&wire[LEN_SIZE..]);
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(WireFrame::Data { stream_id: 1, .. })
        ));
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(WireFrame::Echo { ts: 42 })
        ));
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(WireFrame::Data { stream_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_drain_stops_at_threshold() {
        let pool = BufferPool::default();
        let (_echo_tx, mut echo_rx) = mpsc::channel::<Frame>(1);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        for _ in 0..10 {
            out_tx
                .try_send(data_frame(&pool, 1, &[0xAB; 400]))
                .unwrap();
        }

        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 1, &[0xAB; 400]));
        sender.drain(&mut echo_rx, &mut out_rx);

        // Coalescing admits frames while under the threshold, so the total
        // may exceed it by at most one frame.
        assert!(sender.len >= COALESCE_THRESHOLD);
        assert!(sender.len < COALESCE_THRESHOLD + MAX_FRAME_SIZE);
        // The rest stays queued for the next wakeup.
        assert!(out_rx.try_recv().is_ok());
    }

    #[test]
    fn test_budget_never_overflows_buffer() {
        let pool = BufferPool::default();
        let mut suite = CryptoSuite::plaintext();
        let (_echo_tx, mut echo_rx) = mpsc::channel::<Frame>(1);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        // Worst case: maximum-size frames right up against the threshold.
        for _ in 0..8 {
            out_tx
                .try_send(data_frame(&pool, 1, &[0u8; MAX_DATA_LEN]))
                .unwrap();
        }

        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 1, &[0u8; MAX_DATA_LEN]));
        sender.drain(&mut echo_rx, &mut out_rx);
        let (wire, _) = sender.finish(suite.encryptor.as_mut());
        assert!(wire.len() <= MAX_SESSION_FRAME_SIZE);
    }

    #[test]
    fn test_padding_only_for_lone_small_frames() {
        let pool = BufferPool::default();

        // Lone small frame: padded to somewhere in [len, len + max).
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 1, b"k"));
        let before = sender.len;
        sender.maybe_pad(32).unwrap();
        assert!(sender.len >= before && sender.len < before + 32);

        // Two coalesced frames: never padded.
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 1, b"a"));
        sender.buffer_frame(data_frame(&pool, 2, b"b"));
        let before = sender.len;
        sender.maybe_pad(32).unwrap();
        assert_eq!(sender.len, before);

        // Padding disabled.
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 1, b"k"));
        let before = sender.len;
        sender.maybe_pad(0).unwrap();
        assert_eq!(sender.len, before);
    }

    #[test]
    fn test_padding_invisible_to_parser() {
        let pool = BufferPool::default();
        let mut suite = CryptoSuite::plaintext();
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(data_frame(&pool, 7, b"ping?"));
        sender.maybe_pad(32).unwrap();
        let (wire, _) = sender.finish(suite.encryptor.as_mut());
        assert_eq!(parse(wire), vec![(7, b"ping?".to_vec())]);
    }

    #[test]
    fn test_rst_records_deferred_cleanup() {
        let mut suite = CryptoSuite::plaintext();
        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, 0);
        sender.buffer_frame(Frame::Rst { stream_id: 11 });
        sender.buffer_frame(Frame::Ack {
            stream_id: 4,
            frames: 2,
        });
        sender.buffer_frame(Frame::Rst { stream_id: 12 });
        let (_, closed) = sender.finish(suite.encryptor.as_mut());
        assert_eq!(closed, vec![11, 12]);
    }

    #[test]
    fn test_encrypted_image_roundtrips() {
        let pool = BufferPool::default();
        let suite = CryptoSuite::chacha20_poly1305(&[1u8; 32], &[2u8; 32]);
        let peer = CryptoSuite::chacha20_poly1305(&[2u8; 32], &[1u8; 32]);
        let mut enc = suite.encryptor;
        let mut dec = peer.decryptor;

        let mut buf = vec![0u8; MAX_SESSION_FRAME_SIZE];
        let mut sender = Sender::new(&mut buf, None, enc.overhead());
        sender.buffer_frame(data_frame(&pool, 3, b"sealed"));
        sender.maybe_pad(16).unwrap();
        let (wire, _) = sender.finish(enc.as_mut());

        let mut len_buf = [wire[0], wire[1]];
        dec.decrypt_length(&mut len_buf);
        let n = u16::from_be_bytes(len_buf) as usize;
        assert_eq!(wire.len(), LEN_SIZE + n);

        let mut body = wire[LEN_SIZE..].to_vec();
        let plain = dec.decrypt_payload(&mut body).unwrap();
        let mut reader = FrameReader::new(plain);
        match reader.next_frame().unwrap() {
            Some(WireFrame::Data { stream_id: 3, payload }) => assert_eq!(payload, b"sealed"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(reader.next_frame().unwrap().is_none());
    }
}
