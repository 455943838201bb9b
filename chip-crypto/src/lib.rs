//! Cryptographic primitives for CHIP secure sessions.
//!
//! Provides:
//! - `CryptoContext`: directional session keys derived from a pairing secret
//! - HKDF-SHA256 session key derivation (`"SessionKeys"` info label)
//! - AES-128-CTR payload encryption with a truncated HMAC-SHA256 MIC
//! - SHA-256 hash macro
//!
//! The framing of the nonce and additional authenticated data is left to the
//! caller; this crate only sees byte slices.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod sha;

pub use context::{CryptoContext, SessionRole};

/// Length in bytes of a message integrity check appended to every encrypted
/// message.
pub const MIC_LENGTH: usize = 16;

/// Length in bytes of the per-message nonce.
pub const NONCE_LENGTH: usize = 16;

/// Length in bytes of each derived symmetric key.
pub const SYMMETRIC_KEY_LENGTH: usize = 16;

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Errors from [`CryptoContext`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The context has no keys yet; derive them from a pairing first.
    NotInitialized,
    /// HKDF refused the requested output length.
    KeyDerivation,
    /// A key of unsupported length was supplied to the MAC.
    InvalidKeyLength,
    /// The supplied MIC does not authenticate the ciphertext.
    TagMismatch,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized   => write!(f, "crypto context not initialized"),
            Self::KeyDerivation    => write!(f, "session key derivation failed"),
            Self::InvalidKeyLength => write!(f, "invalid MAC key length"),
            Self::TagMismatch      => write!(f, "message integrity check mismatch"),
        }
    }
}
impl std::error::Error for Error {}
