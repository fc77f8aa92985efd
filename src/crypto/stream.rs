//! Encrypt-on-write / decrypt-on-read stream wrapper.
//!
//! Each direction opens with a short header carrying its own random salt
//! (plus IV for the counter kind); the key for that direction is derived
//! from the passphrase and the salt. Ciphertext is staged in an internal
//! buffer on write and drained into the underlying stream; raw bytes are
//! collected on read until a header or full record is available.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::Aes256;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::{Buf, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{derive_key, CipherKind, SALT_LEN};
use crate::error::decrypt_error;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Plaintext carried per AES-GCM record.
const GCM_RECORD_LEN: usize = 16 * 1024;
/// GCM authentication tag length.
const GCM_TAG_LEN: usize = 16;
/// Staged-ciphertext cap; writes block on the underlying stream beyond this.
const PENDING_LIMIT: usize = 64 * 1024;
/// Chunk size for reads from the underlying stream.
const READ_CHUNK: usize = 8 * 1024;

/// Stateful transform for one direction. The two directions of a stream hold
/// independent instances keyed from independent salts.
enum DirectionCipher {
    Ctr(Box<Aes256Ctr>),
    Gcm { cipher: Box<Aes256Gcm>, seq: u64 },
}

impl DirectionCipher {
    fn new(kind: CipherKind, passphrase: &str, header: &[u8]) -> Self {
        let key = derive_key(passphrase, &header[..SALT_LEN]);
        match kind {
            CipherKind::AesCtr => {
                let iv: [u8; 16] = header[SALT_LEN..]
                    .try_into()
                    .expect("counter-mode header holds exactly one IV");
                DirectionCipher::Ctr(Box::new(Aes256Ctr::new(&key.into(), &iv.into())))
            }
            CipherKind::AesGcm => DirectionCipher::Gcm {
                cipher: Box::new(Aes256Gcm::new(&key.into())),
                seq: 0,
            },
        }
    }
}

fn gcm_nonce(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

/// A byte stream whose writes are encrypted before reaching the underlying
/// stream and whose reads are decrypted after leaving it.
///
/// One reader and one writer may run concurrently (the directions keep
/// independent cipher state); two concurrent writers or two concurrent
/// readers are not supported.
pub struct CipherStream<S> {
    inner: S,
    kind: CipherKind,
    passphrase: String,
    write_cipher: DirectionCipher,
    /// Staged ciphertext, starting with this direction's header.
    write_pending: BytesMut,
    /// Peer-direction cipher; None until the peer's header arrives.
    read_cipher: Option<DirectionCipher>,
    /// Ciphertext not yet decryptable (partial header or record).
    read_raw: BytesMut,
    /// Decrypted bytes not yet handed to the caller.
    read_plain: BytesMut,
    read_eof: bool,
    /// A decryption failure terminates the stream; it replays on every read.
    read_failure: Option<String>,
}

impl<S> CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `inner`, deriving this direction's key material from the
    /// passphrase and a fresh random salt. Prompting for an absent
    /// passphrase is the caller's job; this never prompts.
    pub fn wrap(inner: S, passphrase: &str, kind: CipherKind) -> Self {
        let mut header = vec![0u8; kind.header_len()];
        OsRng.fill_bytes(&mut header);

        let write_cipher = DirectionCipher::new(kind, passphrase, &header);
        let mut write_pending = BytesMut::with_capacity(PENDING_LIMIT);
        write_pending.extend_from_slice(&header);

        Self {
            inner,
            kind,
            passphrase: passphrase.to_string(),
            write_cipher,
            write_pending,
            read_cipher: None,
            read_raw: BytesMut::new(),
            read_plain: BytesMut::new(),
            read_eof: false,
            read_failure: None,
        }
    }

    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "underlying stream refused staged ciphertext",
                )));
            }
            self.write_pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Decrypt whatever is decryptable out of `read_raw` into `read_plain`.
    /// Returns the failure message on undecryptable input.
    fn process_raw(&mut self) -> Result<(), String> {
        if self.read_cipher.is_none() {
            let header_len = self.kind.header_len();
            if self.read_raw.len() < header_len {
                return Ok(());
            }
            let header = self.read_raw.split_to(header_len);
            self.read_cipher = Some(DirectionCipher::new(self.kind, &self.passphrase, &header));
        }

        match self.read_cipher.as_mut().expect("initialized above") {
            DirectionCipher::Ctr(cipher) => {
                if !self.read_raw.is_empty() {
                    let mut chunk = self.read_raw.split();
                    cipher.apply_keystream(&mut chunk);
                    if self.read_plain.is_empty() {
                        self.read_plain = chunk;
                    } else {
                        self.read_plain.extend_from_slice(&chunk);
                    }
                }
            }
            DirectionCipher::Gcm { cipher, seq } => {
                while self.read_raw.len() >= 4 {
                    let len = u32::from_be_bytes(
                        self.read_raw[..4].try_into().expect("length prefix"),
                    ) as usize;
                    if len < GCM_TAG_LEN || len > GCM_RECORD_LEN + GCM_TAG_LEN {
                        return Err(format!("invalid record length {}", len));
                    }
                    if self.read_raw.len() < 4 + len {
                        break;
                    }
                    self.read_raw.advance(4);
                    let record = self.read_raw.split_to(len);
                    let nonce = gcm_nonce(*seq);
                    let plain = cipher
                        .decrypt(Nonce::from_slice(&nonce), record.as_ref())
                        .map_err(|_| "record authentication failed".to_string())?;
                    *seq += 1;
                    self.read_plain.extend_from_slice(&plain);
                }
            }
        }
        Ok(())
    }
}

impl<S> AsyncRead for CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(msg) = &this.read_failure {
                return Poll::Ready(Err(decrypt_error(msg.clone())));
            }
            if !this.read_plain.is_empty() {
                let n = this.read_plain.len().min(buf.remaining());
                buf.put_slice(&this.read_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                if !this.read_raw.is_empty() {
                    let msg = "stream truncated mid-record".to_string();
                    this.read_failure = Some(msg.clone());
                    return Poll::Ready(Err(decrypt_error(msg)));
                }
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.read_eof = true;
            } else {
                this.read_raw.extend_from_slice(chunk_buf.filled());
            }

            if let Err(msg) = this.process_raw() {
                this.read_failure = Some(msg.clone());
                return Poll::Ready(Err(decrypt_error(msg)));
            }
        }
    }
}

impl<S> AsyncWrite for CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();

        if this.write_pending.len() >= PENDING_LIMIT {
            ready!(this.poll_drain_pending(cx))?;
        }

        match &mut this.write_cipher {
            DirectionCipher::Ctr(cipher) => {
                let start = this.write_pending.len();
                this.write_pending.extend_from_slice(buf);
                cipher.apply_keystream(&mut this.write_pending[start..]);
            }
            DirectionCipher::Gcm { cipher, seq } => {
                for chunk in buf.chunks(GCM_RECORD_LEN) {
                    let nonce = gcm_nonce(*seq);
                    let record = cipher
                        .encrypt(Nonce::from_slice(&nonce), chunk)
                        .map_err(|_| io::Error::other("AES-GCM encryption failed"))?;
                    *seq += 1;
                    this.write_pending
                        .extend_from_slice(&(record.len() as u32).to_be_bytes());
                    this.write_pending.extend_from_slice(&record);
                }
            }
        }

        // Opportunistic drain; leftovers go out on the next write or flush.
        let _ = this.poll_drain_pending(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
