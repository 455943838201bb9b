//! Error type shared by every session-layer operation.

use std::{fmt, io};

/// Errors returned by the session layer.
///
/// None of these are fatal: malformed or replayed traffic from an untrusted
/// peer is reported, logged and dropped, never panicked on.
#[derive(Debug)]
pub enum Error {
    /// API used in the wrong lifecycle state (e.g. send before `init`).
    IncorrectState,
    /// Rejected input: disallowed address class, empty buffer, reused id.
    InvalidArgument,
    /// The buffer is fragmented or too short for what it claims to hold.
    InvalidMessageLength,
    /// No secure session exists for the given handle.
    NotConnected,
    /// A session could not be admitted because the table is full.
    NoMemory,
    /// A fixed-capacity table has no free slot.
    CapacityExceeded,
    /// An encrypted message named a session id we do not hold.
    KeyNotFoundFromPeer,
    /// The message counter was already accepted.
    DuplicateMessageReceived,
    /// The local send counter reached `u32::MAX` and cannot advance.
    CounterExhausted,
    /// Not enough bytes left to decode a header.
    BufferTooSmall,
    /// A header field has an unsupported value.
    InvalidHeader(&'static str),
    /// Session crypto rejected the message.
    Crypto(chip_crypto::Error),
    /// The transport failed to hand the datagram off.
    Transport(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncorrectState           => write!(f, "incorrect state"),
            Self::InvalidArgument          => write!(f, "invalid argument"),
            Self::InvalidMessageLength     => write!(f, "invalid message length"),
            Self::NotConnected             => write!(f, "not connected"),
            Self::NoMemory                 => write!(f, "no memory"),
            Self::CapacityExceeded         => write!(f, "session table capacity exceeded"),
            Self::KeyNotFoundFromPeer      => write!(f, "key not found from peer"),
            Self::DuplicateMessageReceived => write!(f, "duplicate message received"),
            Self::CounterExhausted         => write!(f, "message counter exhausted"),
            Self::BufferTooSmall           => write!(f, "buffer too small"),
            Self::InvalidHeader(field)     => write!(f, "invalid header field: {field}"),
            Self::Crypto(e)                => write!(f, "crypto: {e}"),
            Self::Transport(e)             => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crypto(e)    => Some(e),
            Self::Transport(e) => Some(e),
            _                  => None,
        }
    }
}

impl From<chip_crypto::Error> for Error {
    fn from(e: chip_crypto::Error) -> Self { Self::Crypto(e) }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Self::Transport(e) }
}

impl Error {
    /// True for the duplicate-counter condition, which callers treat as a
    /// protocol state rather than a failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessageReceived)
    }
}
