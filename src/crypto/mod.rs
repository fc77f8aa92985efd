//! Symmetric encryption for the tunnel byte stream.
//!
//! [`CipherStream`] wraps any byte stream and transparently encrypts writes
//! and decrypts reads. Key material is derived from a passphrase with a
//! random per-direction salt, so the two directions of a tunnel never share
//! a key stream.

mod stream;

pub use stream::CipherStream;

use std::fmt;
use std::str::FromStr;

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::TunnelError;

/// Salt length carried in each direction's stream header.
pub const SALT_LEN: usize = 16;
/// IV length for the counter-mode kind.
pub const IV_LEN: usize = 16;

/// The supported symmetric cipher kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-256-CTR. No integrity: a wrong passphrase yields garbage bytes.
    AesCtr,
    /// AES-256-GCM in length-prefixed records. A wrong passphrase or a
    /// tampered record surfaces as a decryption failure.
    AesGcm,
}

impl CipherKind {
    /// Length of the per-direction stream header for this kind.
    pub(crate) fn header_len(self) -> usize {
        match self {
            CipherKind::AesCtr => SALT_LEN + IV_LEN,
            CipherKind::AesGcm => SALT_LEN,
        }
    }
}

impl FromStr for CipherKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-ctr" => Ok(CipherKind::AesCtr),
            "aes-gcm" => Ok(CipherKind::AesGcm),
            other => Err(TunnelError::Setup(format!(
                "unknown cipher kind {:?}, expected aes-ctr or aes-gcm",
                other
            ))),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::AesCtr => f.write_str("aes-ctr"),
            CipherKind::AesGcm => f.write_str("aes-gcm"),
        }
    }
}

/// Derive a 256-bit key from the passphrase and a per-direction salt.
pub(crate) fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), passphrase.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(b"sluice stream key", &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}
