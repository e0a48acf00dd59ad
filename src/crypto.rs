//! The crypto capability consumed by the session core.
//!
//! The multiplexer never negotiates cipher suites or derives keys; it
//! consumes four operations split across two independent boundaries:
//!
//! - **Length boundary**: the 2-byte session-frame length is encrypted and
//!   decrypted in place with a stateful keystream, so frame sizes are not
//!   observable on the wire.
//! - **Payload boundary**: the coalesced frame payload is sealed as one
//!   message, with a fixed per-message overhead used for budget accounting.
//!
//! One direction's state lives in an [`Encryptor`], the other's in a
//! [`Decryptor`]; the send task owns the former, the receive task the latter,
//! so no locking is needed. Keystream and nonce state advance per message and
//! must stay in step with the peer, which is why any decrypt failure is fatal
//! to the whole session.
//!
//! Two suites are provided: [`CryptoSuite::plaintext`] (tests, wire
//! inspection) and [`CryptoSuite::chacha20_poly1305`]. Key agreement happens
//! elsewhere; callers supply independently derived 32-byte keys per
//! direction.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};

use crate::error::{Error, Result};

/// AEAD tag length of the ChaCha20-Poly1305 suite.
const TAG_LEN: usize = 16;

/// IV for the length-field keystream, distinct from the all-zero prefix of
/// the payload nonces so the two boundaries never share cipher state.
const LENGTH_IV: [u8; 12] = [0xA5; 12];

/// Outbound half of the crypto capability. Owned by the send task.
pub trait Encryptor: Send + 'static {
    /// Fixed per-message overhead in bytes, used for coalescing budget
    /// accounting.
    fn overhead(&self) -> usize;

    /// Encrypt the 2-byte length field in place.
    fn encrypt_length(&mut self, buf: &mut [u8]);

    /// Encrypt `buf[..plaintext_len]` in place, growing by at most
    /// [`Self::overhead`] bytes; returns the number of bytes written.
    ///
    /// The caller guarantees `buf.len() >= plaintext_len + overhead()`.
    fn encrypt_payload(&mut self, buf: &mut [u8], plaintext_len: usize) -> usize;
}

/// Inbound half of the crypto capability. Owned by the receive task.
pub trait Decryptor: Send + 'static {
    /// Decrypt the 2-byte length field in place.
    fn decrypt_length(&mut self, buf: &mut [u8]);

    /// Decrypt one session-frame payload in place, returning the plaintext.
    fn decrypt_payload<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8]>;
}

/// A paired encryptor and decryptor handed to [`Session::start`].
///
/// [`Session::start`]: crate::session::Session::start
pub struct CryptoSuite {
    pub encryptor: Box<dyn Encryptor>,
    pub decryptor: Box<dyn Decryptor>,
}

impl CryptoSuite {
    /// No-op suite with zero overhead. For tests and wire inspection only.
    pub fn plaintext() -> Self {
        Self {
            encryptor: Box::new(PlaintextCrypter),
            decryptor: Box::new(PlaintextCrypter),
        }
    }

    /// ChaCha20-Poly1305 payload cipher with a ChaCha20 keystream over the
    /// length field. `send_key` seals outbound frames, `recv_key` opens
    /// inbound ones; the peer passes the same keys swapped.
    pub fn chacha20_poly1305(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            encryptor: Box::new(ChaChaEncryptor {
                aead: ChaCha20Poly1305::new(Key::from_slice(send_key)),
                length: ChaCha20::new(send_key.into(), (&LENGTH_IV).into()),
                nonce_counter: 0,
            }),
            decryptor: Box::new(ChaChaDecryptor {
                aead: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
                length: ChaCha20::new(recv_key.into(), (&LENGTH_IV).into()),
                nonce_counter: 0,
            }),
        }
    }
}

struct PlaintextCrypter;

impl Encryptor for PlaintextCrypter {
    fn overhead(&self) -> usize {
        0
    }

    fn encrypt_length(&mut self, _buf: &mut [u8]) {}

    fn encrypt_payload(&mut self, _buf: &mut [u8], plaintext_len: usize) -> usize {
        plaintext_len
    }
}

impl Decryptor for PlaintextCrypter {
    fn decrypt_length(&mut self, _buf: &mut [u8]) {}

    fn decrypt_payload<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        Ok(buf)
    }
}

fn message_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(nonce)
}

struct ChaChaEncryptor {
    aead: ChaCha20Poly1305,
    length: ChaCha20,
    nonce_counter: u64,
}

impl Encryptor for ChaChaEncryptor {
    fn overhead(&self) -> usize {
        TAG_LEN
    }

    fn encrypt_length(&mut self, buf: &mut [u8]) {
        self.length.apply_keystream(buf);
    }

    fn encrypt_payload(&mut self, buf: &mut [u8], plaintext_len: usize) -> usize {
        debug_assert!(buf.len() >= plaintext_len + TAG_LEN);
        let nonce = message_nonce(self.nonce_counter);
        self.nonce_counter += 1;
        let tag = self
            .aead
            .encrypt_in_place_detached(&nonce, &[], &mut buf[..plaintext_len])
            .expect("ChaCha20-Poly1305 sealing is infallible for in-range lengths");
        buf[plaintext_len..plaintext_len + TAG_LEN].copy_from_slice(&tag);
        plaintext_len + TAG_LEN
    }
}

struct ChaChaDecryptor {
    aead: ChaCha20Poly1305,
    length: ChaCha20,
    nonce_counter: u64,
}

impl Decryptor for ChaChaDecryptor {
    fn decrypt_length(&mut self, buf: &mut [u8]) {
        self.length.apply_keystream(buf);
    }

    fn decrypt_payload<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        if buf.len() < TAG_LEN {
            return Err(Error::Decrypt(format!(
                "session frame of {} bytes is shorter than the {}-byte tag",
                buf.len(),
                TAG_LEN
            )));
        }
        let plaintext_len = buf.len() - TAG_LEN;
        let tag = Tag::clone_from_slice(&buf[plaintext_len..]);
        let nonce = message_nonce(self.nonce_counter);
        self.nonce_counter += 1;
        self.aead
            .decrypt_in_place_detached(&nonce, &[], &mut buf[..plaintext_len], &tag)
            .map_err(|_| Error::Decrypt("authentication failed".to_string()))?;
        Ok(&buf[..plaintext_len])
    }
}
