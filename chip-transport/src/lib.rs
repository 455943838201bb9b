//! CHIP secure session layer.
//!
//! This crate handles:
//! * Secure and unauthenticated session tables, with idle expiry
//! * Message framing (packet and payload headers)
//! * Per-session send counters and a sliding anti-replay window
//! * Admitting sessions produced by a pairing handshake
//! * Parking messages while a peer counter is resynchronized
//!
//! It is intentionally transport-agnostic: implement [`TransportMgr`] and
//! [`SystemLayer`] over your own sockets and event loop, then feed received
//! datagrams to [`SessionManager::on_message_received`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod codec;
pub mod config;
pub mod counter;
pub mod counter_sync;
pub mod delegate;
pub mod error;
pub mod header;
pub mod manager;
pub mod peer_address;
pub mod peer_connections;
pub mod session;
pub mod transport;
pub mod unauthenticated;

pub use buffer::{EncryptedPacketBuffer, PacketBuffer};
pub use codec::{AeadMessageCodec, SecureMessageCodec};
pub use config::SessionManagerConfig;
pub use counter::{MessageCounter, PeerMessageCounter};
pub use counter_sync::{
    CounterSyncManager, MessageCounterSync, QueuedMessage, SyncRequestSender, DEFAULT_SYNC_RESPONSE_TIMEOUT,
};
pub use delegate::{DuplicateMessage, SessionMgrDelegate};
pub use error::Error;
pub use header::{PacketHeader, PayloadHeader};
pub use manager::{SessionManager, State};
pub use peer_address::{PeerAddress, TransportType};
pub use session::{
    FabricIndex, NodeId, PairingSession, PeerConnectionState, SessionHandle, SharedSecretPairing,
};
pub use transport::{SystemLayer, TimerId, TransportMgr};

pub use chip_crypto::SessionRole;
