//! Frame sealing with AES-256-GCM.
//!
//! Each transport direction seals its frames under the client's pre-shared
//! key with a counter nonce: a per-connection 4-byte prefix chosen during
//! the handshake followed by a monotonically increasing counter. TCP
//! delivers sealed frames in order, so both sides advance their counters
//! in lockstep.

use crate::error::UploadError;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM,
};
use ring::rand::{SecureRandom, SystemRandom};

/// AEAD tag overhead per sealed frame.
pub const TAG_LEN: usize = 16;

struct CounterNonce {
    prefix: u32,
    counter: u64,
}

impl CounterNonce {
    fn new(prefix: u32) -> Self {
        Self { prefix, counter: 0 }
    }
}

impl NonceSequence for CounterNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[0..4].copy_from_slice(&self.prefix.to_be_bytes());
        nonce_bytes[4..12].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Seals outgoing frames for one transport direction.
pub struct FrameSealer {
    key: SealingKey<CounterNonce>,
}

impl FrameSealer {
    pub fn new(secret: &[u8; 32], nonce_prefix: u32) -> Result<Self, UploadError> {
        let unbound = UnboundKey::new(&AES_256_GCM, secret)
            .map_err(|e| UploadError::Crypto(format!("failed to create sealing key: {e:?}")))?;
        Ok(Self {
            key: SealingKey::new(unbound, CounterNonce::new(nonce_prefix)),
        })
    }

    /// Encrypts `data` in place and appends the authentication tag.
    pub fn seal(&mut self, data: &mut Vec<u8>) -> Result<(), UploadError> {
        self.key
            .seal_in_place_append_tag(Aad::empty(), data)
            .map_err(|e| UploadError::Crypto(format!("sealing failed: {e:?}")))?;
        Ok(())
    }
}

/// Opens incoming frames for one transport direction.
pub struct FrameOpener {
    key: OpeningKey<CounterNonce>,
}

impl FrameOpener {
    pub fn new(secret: &[u8; 32], nonce_prefix: u32) -> Result<Self, UploadError> {
        let unbound = UnboundKey::new(&AES_256_GCM, secret)
            .map_err(|e| UploadError::Crypto(format!("failed to create opening key: {e:?}")))?;
        Ok(Self {
            key: OpeningKey::new(unbound, CounterNonce::new(nonce_prefix)),
        })
    }

    /// Decrypts `data` in place and returns the plaintext length.
    pub fn open(&mut self, data: &mut Vec<u8>) -> Result<usize, UploadError> {
        let plaintext_len = self
            .key
            .open_in_place(Aad::empty(), data)
            .map_err(|_| UploadError::Crypto("frame failed authentication".into()))?
            .len();
        data.truncate(plaintext_len);
        Ok(plaintext_len)
    }
}

/// Generates a fresh 32-byte pre-shared secret.
pub fn generate_secret() -> Result<[u8; 32], UploadError> {
    let rng = SystemRandom::new();
    let mut secret = [0u8; 32];
    rng.fill(&mut secret)
        .map_err(|e| UploadError::Crypto(format!("failed to generate secret: {e:?}")))?;
    Ok(secret)
}
