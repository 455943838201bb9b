//! Per-peer session state.

use std::time::Instant;

use chip_crypto::{CryptoContext, SessionRole};

use crate::counter::{MessageCounter, PeerMessageCounter, SessionMessageCounter};
use crate::error::Error;
use crate::peer_address::PeerAddress;

/// Operational node identifier.
pub type NodeId = u64;

/// Index of the fabric (trust domain) a session belongs to.
pub type FabricIndex = u8;

/// Node id used before the peer's identity is known.
pub const UNDEFINED_NODE_ID: NodeId = 0;

/// Fabric index used before a fabric is assigned.
pub const UNDEFINED_FABRIC_INDEX: FabricIndex = 0;

// ─── SessionHandle ────────────────────────────────────────────────────────────

/// The only externally visible reference to a session.
///
/// Handles are plain values; the manager resolves them to a record afresh on
/// every call, so a handle to an expired session simply stops resolving.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionHandle {
    /// A paired, encrypted session.
    Secure {
        /// Peer node id.
        peer_node_id:     NodeId,
        /// Our session id (the id the peer puts on the wire).
        local_session_id: u16,
        /// The peer's session id (the id we put on the wire).
        peer_session_id:  u16,
        /// Fabric the session belongs to.
        fabric:           FabricIndex,
    },
    /// A plaintext session keyed by peer address.
    Unauthenticated(PeerAddress),
}

impl SessionHandle {
    /// Build a secure handle.
    pub fn secure(peer_node_id: NodeId, local_session_id: u16, peer_session_id: u16, fabric: FabricIndex) -> Self {
        Self::Secure { peer_node_id, local_session_id, peer_session_id, fabric }
    }

    /// True for paired sessions.
    pub fn is_secure(&self) -> bool { matches!(self, Self::Secure { .. }) }

    /// Peer node id for secure sessions.
    pub fn peer_node_id(&self) -> Option<NodeId> {
        match self {
            Self::Secure { peer_node_id, .. } => Some(*peer_node_id),
            Self::Unauthenticated(_)          => None,
        }
    }

    /// Fabric index for secure sessions.
    pub fn fabric(&self) -> Option<FabricIndex> {
        match self {
            Self::Secure { fabric, .. } => Some(*fabric),
            Self::Unauthenticated(_)    => None,
        }
    }
}

// ─── PeerConnectionState ──────────────────────────────────────────────────────

/// A secure session record.
///
/// Owns the session's crypto context; the context lives exactly as long as
/// the record does.
#[derive(Debug)]
pub struct PeerConnectionState {
    peer_node_id:     NodeId,
    peer_session_id:  u16,
    local_session_id: u16,
    fabric:           FabricIndex,
    peer_address:     PeerAddress,
    last_activity:    Instant,
    crypto:           CryptoContext,
    counters:         SessionMessageCounter,
}

impl PeerConnectionState {
    pub(crate) fn new(peer_node_id: NodeId, peer_session_id: u16, local_session_id: u16, now: Instant) -> Self {
        Self {
            peer_node_id,
            peer_session_id,
            local_session_id,
            fabric:        UNDEFINED_FABRIC_INDEX,
            peer_address:  PeerAddress::uninitialized(),
            last_activity: now,
            crypto:        CryptoContext::new(),
            counters:      SessionMessageCounter::new(),
        }
    }

    /// Peer node id.
    pub fn peer_node_id(&self) -> NodeId { self.peer_node_id }

    /// The peer's session id.
    pub fn peer_session_id(&self) -> u16 { self.peer_session_id }

    /// Our session id.
    pub fn local_session_id(&self) -> u16 { self.local_session_id }

    /// Fabric index.
    pub fn fabric_index(&self) -> FabricIndex { self.fabric }

    pub(crate) fn set_fabric_index(&mut self, fabric: FabricIndex) { self.fabric = fabric; }

    /// Last address the peer was seen at.
    pub fn peer_address(&self) -> &PeerAddress { &self.peer_address }

    pub(crate) fn set_peer_address(&mut self, addr: PeerAddress) { self.peer_address = addr; }

    /// When the session last sent or received.
    pub fn last_activity(&self) -> Instant { self.last_activity }

    pub(crate) fn set_last_activity(&mut self, now: Instant) { self.last_activity = now; }

    /// The session's crypto context.
    pub fn crypto(&self) -> &CryptoContext { &self.crypto }

    pub(crate) fn crypto_mut(&mut self) -> &mut CryptoContext { &mut self.crypto }

    /// Read-only view of the peer receive tracker.
    pub fn peer_message_counter(&self) -> &PeerMessageCounter { self.counters.peer() }

    pub(crate) fn counters_mut(&mut self) -> &mut SessionMessageCounter { &mut self.counters }

    /// Split borrow: the crypto context and the send counter for the given
    /// message class.
    pub(crate) fn crypto_and_send_counter(&mut self, control: bool) -> (&CryptoContext, &mut MessageCounter) {
        let counter = if control {
            self.counters.local_control_counter()
        } else {
            self.counters.local_message_counter()
        };
        (&self.crypto, counter)
    }

    /// The handle that refers to this record.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::secure(self.peer_node_id, self.local_session_id, self.peer_session_id, self.fabric)
    }
}

// ─── UnauthenticatedSession ───────────────────────────────────────────────────

/// A plaintext session, keyed by peer address.
#[derive(Clone, Debug)]
pub struct UnauthenticatedSession {
    peer_address:  PeerAddress,
    last_activity: Instant,
    local_counter: MessageCounter,
    peer_counter:  PeerMessageCounter,
}

impl UnauthenticatedSession {
    pub(crate) fn new(peer_address: PeerAddress, now: Instant) -> Self {
        Self {
            peer_address,
            last_activity: now,
            local_counter: MessageCounter::new(),
            peer_counter:  PeerMessageCounter::new(),
        }
    }

    /// The peer address this session is keyed by.
    pub fn peer_address(&self) -> &PeerAddress { &self.peer_address }

    /// When the session last sent or received.
    pub fn last_activity(&self) -> Instant { self.last_activity }

    pub(crate) fn set_last_activity(&mut self, now: Instant) { self.last_activity = now; }

    /// Local send counter.
    pub fn local_message_counter(&mut self) -> &mut MessageCounter { &mut self.local_counter }

    /// Peer receive tracker (trust-on-first-use).
    pub fn peer_message_counter(&mut self) -> &mut PeerMessageCounter { &mut self.peer_counter }

    /// The handle that refers to this session.
    pub fn handle(&self) -> SessionHandle { SessionHandle::Unauthenticated(self.peer_address) }
}

// ─── Pairing ──────────────────────────────────────────────────────────────────

/// The result of a completed pairing handshake.
///
/// The handshake itself lives elsewhere; the session layer only needs the
/// negotiated ids, the peer's starting counter and a way to derive keys.
pub trait PairingSession {
    /// Our session id.
    fn local_session_id(&self) -> u16;

    /// The peer's session id.
    fn peer_session_id(&self) -> u16;

    /// The last counter value the peer used during the handshake, if the
    /// handshake carried one. Without it the session starts unsynchronized
    /// and the first inbound message triggers a counter sync.
    fn peer_counter(&self) -> Option<u32>;

    /// Fill `ctx` with the session keys for `role`.
    fn derive_secure_session(&self, ctx: &mut CryptoContext, role: SessionRole) -> Result<(), Error>;
}

/// A pairing whose keys come from a pre-shared secret.
///
/// Used by tests, demos and commissioning flows that establish the secret
/// out of band.
#[derive(Clone, Debug)]
pub struct SharedSecretPairing {
    /// Our session id.
    pub local_session_id: u16,
    /// The peer's session id.
    pub peer_session_id:  u16,
    /// Starting peer counter; `None` leaves the session unsynchronized.
    pub peer_counter:     Option<u32>,
    /// Input keying material.
    pub secret:           Vec<u8>,
    /// HKDF salt.
    pub salt:             Vec<u8>,
}

impl PairingSession for SharedSecretPairing {
    fn local_session_id(&self) -> u16 { self.local_session_id }
    fn peer_session_id(&self) -> u16 { self.peer_session_id }
    fn peer_counter(&self) -> Option<u32> { self.peer_counter }

    fn derive_secure_session(&self, ctx: &mut CryptoContext, role: SessionRole) -> Result<(), Error> {
        ctx.init_from_secret(&self.secret, &self.salt, role)?;
        Ok(())
    }
}
