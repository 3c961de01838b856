//! Authenticated framing for post-handshake traffic.
//!
//! During the handshake the server draws a fresh scalar, computes its
//! public point against the project base point, and agrees on a shared
//! secret with the client public key. HKDF-SHA256 over that secret and
//! the project salt yields two keys that live for exactly one
//! subscription:
//!
//! - info `[0x00]`: 16-byte RC4 keystream key
//! - info `[0x01]`: 32-byte HMAC-SHA256 key
//!
//! Every sealed frame is laid out as `tag(32) || ciphertext`, where the
//! tag covers the ciphertext, the protocol version byte, the
//! little-endian base timestamp, and the subscription UUID:
//!
//! ```text
//! tag = HMAC-SHA256(mac_key, ct || 0x64 || LE64(base_timestamp) || sub_id)
//! ```
//!
//! Binding the connection context into the MAC means a frame replayed
//! into another subscription, or past a reconnect, fails verification.
//!
//! # Invariants
//!
//! - keys are installed once per subscription and never rotated
//! - only packets with opcode at or above Identify use the envelope; the
//!   bootstrap and handshake exchanges carry no secret
//! - verification happens in constant time before any decryption

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use rc4::consts::U16;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::x25519;

type HmacSha256 = Hmac<Sha256>;

/// Protocol version byte mixed into every MAC (SWS 1.0.0).
pub const VERSION_SWS_100: u8 = 0x64;

/// Length of the leading MAC tag in a sealed frame.
pub const TAG_LEN: usize = 32;

/// Errors raised by key derivation and sealed-frame processing.
///
/// None of these leak specifics to the client; the session layer maps
/// them all to a single generic drop reason.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The X25519 agreement produced an all-zero shared secret, meaning
    /// the peer sent a low-order point.
    #[error("degenerate shared secret")]
    DegenerateSharedSecret,

    /// HKDF expansion failed.
    #[error("key derivation failed")]
    KeyDerivation,

    /// A sealed frame was shorter than the MAC tag.
    #[error("sealed frame too short")]
    TooShort,

    /// The MAC tag did not verify.
    #[error("mac signature verification failed")]
    MacMismatch,
}

/// The connection context a sealed frame is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeContext {
    /// Subscription UUID bytes.
    pub sub_id: [u8; 16],
    /// Unix seconds fixed at accept.
    pub base_timestamp: u64,
}

/// Per-subscription symmetric keys, installed at the end of Handshake.
#[derive(Clone)]
pub struct Envelope {
    mac_key: [u8; 32],
    stream_key: [u8; 16],
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("mac_key", &"<redacted>")
            .field("stream_key", &"<redacted>")
            .finish()
    }
}

impl Envelope {
    /// Perform the server side of the handshake with a fresh scalar.
    ///
    /// Returns the envelope together with the server public point to
    /// send back to the client.
    ///
    /// # Errors
    ///
    /// Fails on a degenerate shared secret or HKDF failure; the caller
    /// must close the subscription without advancing state.
    pub fn derive(
        client_public: &[u8; 32],
        base_point: &[u8; 32],
        salt: &[u8],
    ) -> Result<(Self, [u8; 32]), EnvelopeError> {
        let mut scalar = [0u8; 32];
        OsRng.fill_bytes(&mut scalar);
        Self::derive_with_scalar(&scalar, client_public, base_point, salt)
    }

    /// Deterministic core of [`Envelope::derive`], split out so tests can
    /// pin the scalar.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Envelope::derive`].
    pub fn derive_with_scalar(
        scalar: &[u8; 32],
        client_public: &[u8; 32],
        base_point: &[u8; 32],
        salt: &[u8],
    ) -> Result<(Self, [u8; 32]), EnvelopeError> {
        let server_public = x25519(*scalar, *base_point);
        let shared = x25519(*scalar, *client_public);
        let envelope = Self::from_shared(&shared, salt)?;
        Ok((envelope, server_public))
    }

    /// Derive the envelope keys from an agreed shared secret.
    ///
    /// The client side of the exchange arrives at the same secret via
    /// its own scalar and the server public point, so this is the one
    /// derivation both ends share.
    ///
    /// # Errors
    ///
    /// Rejects an all-zero secret and propagates HKDF failures.
    pub fn from_shared(shared: &[u8; 32], salt: &[u8]) -> Result<Self, EnvelopeError> {
        if shared.iter().all(|byte| *byte == 0) {
            return Err(EnvelopeError::DegenerateSharedSecret);
        }

        let kdf = Hkdf::<Sha256>::new(Some(salt), shared);

        let mut stream_key = [0u8; 16];
        kdf.expand(&[0x00], &mut stream_key)
            .map_err(|_| EnvelopeError::KeyDerivation)?;

        let mut mac_key = [0u8; 32];
        kdf.expand(&[0x01], &mut mac_key)
            .map_err(|_| EnvelopeError::KeyDerivation)?;

        Ok(Self {
            mac_key,
            stream_key,
        })
    }

    /// Seal a plaintext payload into `tag(32) || ciphertext`.
    #[must_use]
    pub fn seal(&self, plaintext: &[u8], ctx: &EnvelopeContext) -> Vec<u8> {
        let mut ciphertext = plaintext.to_vec();
        self.keystream(&mut ciphertext);

        let tag = self.tag(&ciphertext, ctx);

        let mut frame = Vec::with_capacity(TAG_LEN + ciphertext.len());
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&ciphertext);
        frame
    }

    /// Verify and decrypt a sealed frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::TooShort`] for frames below the tag
    /// length and [`EnvelopeError::MacMismatch`] when the tag does not
    /// verify. Verification is constant time and happens before
    /// decryption.
    pub fn open(&self, frame: &[u8], ctx: &EnvelopeContext) -> Result<Vec<u8>, EnvelopeError> {
        if frame.len() < TAG_LEN {
            return Err(EnvelopeError::TooShort);
        }

        let (tag, ciphertext) = frame.split_at(TAG_LEN);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(ciphertext);
        mac.update(&[VERSION_SWS_100]);
        mac.update(&ctx.base_timestamp.to_le_bytes());
        mac.update(&ctx.sub_id);
        mac.verify_slice(tag)
            .map_err(|_| EnvelopeError::MacMismatch)?;

        let mut plaintext = ciphertext.to_vec();
        self.keystream(&mut plaintext);
        Ok(plaintext)
    }

    /// Compute the MAC tag over a ciphertext and connection context.
    fn tag(&self, ciphertext: &[u8], ctx: &EnvelopeContext) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(ciphertext);
        mac.update(&[VERSION_SWS_100]);
        mac.update(&ctx.base_timestamp.to_le_bytes());
        mac.update(&ctx.sub_id);
        mac.finalize().into_bytes().into()
    }

    /// Apply the RC4 keystream in place. A fresh cipher instance per
    /// message keeps the stream stateless across frames, matching the
    /// client.
    fn keystream(&self, buf: &mut [u8]) {
        let mut cipher: Rc4<U16> = Rc4::new((&self.stream_key).into());
        cipher.apply_keystream(buf);
    }
}
