//! The secure session manager.
//!
//! # Flow
//!
//! ```text
//! let mut mgr = SessionManager::new(SessionManagerConfig::default());
//! mgr.init(system_layer, transport, counter_sync)?;
//! mgr.set_delegate(upper_layer);
//! let session = mgr.new_pairing(Some(addr), peer_node_id, &pairing, role, fabric)?;
//! let prepared = mgr.prepare_message(&session, &payload_header, payload)?;
//! mgr.send_prepared_message(&session, &prepared)?;
//! // event loop: mgr.on_message_received(source, datagram) / mgr.on_expiry_timer()
//! ```
//!
//! Everything runs on the caller's thread. The manager is entered only from
//! the owning event loop (transport receive, timer, or upper-layer calls),
//! never concurrently, so there is no locking.

use std::time::Instant;

use chip_crypto::SessionRole;

use crate::buffer::{EncryptedPacketBuffer, PacketBuffer};
use crate::codec::{AeadMessageCodec, SecureMessageCodec};
use crate::config::SessionManagerConfig;
use crate::counter_sync::CounterSyncManager;
use crate::delegate::{DuplicateMessage, SessionMgrDelegate};
use crate::error::Error;
use crate::header::{PacketHeader, PayloadHeader};
use crate::peer_address::{PeerAddress, TransportType};
use crate::peer_connections::PeerConnections;
use crate::session::{FabricIndex, NodeId, PairingSession, PeerConnectionState, SessionHandle};
use crate::transport::{SystemLayer, TimerId, TransportMgr};
use crate::unauthenticated::UnauthenticatedSessionTable;

/// Lifecycle state of a [`SessionManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Constructed or shut down; no collaborators attached.
    NotReady,
    /// `init` succeeded.
    Initialized,
}

/// Owns every session and routes messages to and from them.
pub struct SessionManager {
    state:            State,
    config:           SessionManagerConfig,
    peer_connections: PeerConnections,
    unauthenticated:  UnauthenticatedSessionTable,
    codec:            Box<dyn SecureMessageCodec>,
    system_layer:     Option<Box<dyn SystemLayer>>,
    transport:        Option<Box<dyn TransportMgr>>,
    counter_sync:     Option<Box<dyn CounterSyncManager>>,
    delegate:         Option<Box<dyn SessionMgrDelegate>>,
}

impl SessionManager {
    /// A manager using the default [`AeadMessageCodec`].
    pub fn new(config: SessionManagerConfig) -> Self {
        Self::with_codec(config, Box::new(AeadMessageCodec))
    }

    /// A manager using a custom codec.
    pub fn with_codec(config: SessionManagerConfig, codec: Box<dyn SecureMessageCodec>) -> Self {
        Self {
            state:            State::NotReady,
            peer_connections: PeerConnections::new(config.max_peer_connections),
            unauthenticated:  UnauthenticatedSessionTable::new(
                config.max_unauthenticated_sessions,
                config.unauthenticated_min_idle,
            ),
            config,
            codec,
            system_layer:     None,
            transport:        None,
            counter_sync:     None,
            delegate:         None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State { self.state }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &SessionManagerConfig { &self.config }

    /// Attach collaborators and arm the expiry timer.
    pub fn init(
        &mut self,
        system_layer: Box<dyn SystemLayer>,
        transport:    Box<dyn TransportMgr>,
        counter_sync: Box<dyn CounterSyncManager>,
    ) -> Result<(), Error> {
        if self.state != State::NotReady {
            return Err(Error::IncorrectState);
        }
        self.system_layer = Some(system_layer);
        self.transport    = Some(transport);
        self.counter_sync = Some(counter_sync);
        self.state        = State::Initialized;

        self.schedule_expiry_timer();
        log::info!("[session] Session manager initialized");
        Ok(())
    }

    /// Cancel the expiry timer and detach every collaborator.
    pub fn shutdown(&mut self) {
        if let Some(layer) = self.system_layer.as_mut() {
            layer.cancel_timer(TimerId::SessionExpiry);
        }
        self.counter_sync = None;
        self.state        = State::NotReady;
        self.system_layer = None;
        self.transport    = None;
        self.delegate     = None;
    }

    /// Install the upper-layer callback target, replacing any previous one.
    pub fn set_delegate(&mut self, delegate: Box<dyn SessionMgrDelegate>) {
        self.delegate = Some(delegate);
    }

    fn now(&self) -> Instant {
        self.system_layer.as_ref().map_or_else(Instant::now, |l| l.now())
    }

    fn lookup(&self, session: &SessionHandle) -> Option<usize> {
        match session {
            SessionHandle::Secure { peer_node_id, local_session_id, .. } => {
                self.peer_connections.find_by_local_key(Some(*peer_node_id), *local_session_id)
            }
            SessionHandle::Unauthenticated(_) => None,
        }
    }

    /// The secure record behind `session`, if it still exists.
    pub fn peer_connection_state(&self, session: &SessionHandle) -> Option<&PeerConnectionState> {
        self.lookup(session).and_then(|idx| self.peer_connections.get(idx))
    }

    /// Where messages for `session` are currently sent.
    pub fn peer_address(&self, session: &SessionHandle) -> Option<PeerAddress> {
        match session {
            SessionHandle::Secure { .. } => self.peer_connection_state(session).map(|s| *s.peer_address()),
            SessionHandle::Unauthenticated(addr) => Some(*addr),
        }
    }

    /// Read-only view of the secure session table.
    pub fn peer_connections(&self) -> &PeerConnections { &self.peer_connections }

    /// Read-only view of the unauthenticated session table.
    pub fn unauthenticated_sessions(&self) -> &UnauthenticatedSessionTable { &self.unauthenticated }

    // ─── Outbound ────────────────────────────────────────────────────────────

    /// Frame (and for secure sessions, encrypt) `message` for `session`.
    ///
    /// Advances the session's send counter exactly once on success. For a
    /// secure handle without a record this fails with
    /// [`Error::NotConnected`] before anything is written.
    pub fn prepare_message(
        &mut self,
        session:        &SessionHandle,
        payload_header: &PayloadHeader,
        mut message:    PacketBuffer,
    ) -> Result<EncryptedPacketBuffer, Error> {
        let mut packet_header = PacketHeader::default();
        let control = payload_header.is_control_message();
        if control {
            packet_header.set_secure_session_control_msg(true);
        }

        match session {
            SessionHandle::Secure { .. } => {
                let idx = self.lookup(session).ok_or(Error::NotConnected)?;
                let state = self.peer_connections.get_mut(idx).ok_or(Error::NotConnected)?;
                packet_header.session_id = state.peer_session_id();
                let peer_node_id = state.peer_node_id();

                let (crypto, counter) = state.crypto_and_send_counter(control);
                self.codec.encode(crypto, payload_header, &mut packet_header, &mut message, counter)?;

                log::debug!(
                    "[session] Build encrypted message to {peer_node_id:#018x} of type {} and protocol {} on exchange {} with counter {}",
                    payload_header.message_type,
                    payload_header.protocol_id,
                    payload_header.exchange_id,
                    packet_header.counter,
                );
            }
            SessionHandle::Unauthenticated(addr) => {
                let now = self.now();
                let idx = self.unauthenticated.find_or_allocate(addr, now).ok_or(Error::NoMemory)?;
                let unauthenticated = self.unauthenticated.get_mut(idx).ok_or(Error::NoMemory)?;

                payload_header.encode_before_data(&mut message);
                let counter = unauthenticated.local_message_counter();
                packet_header.counter = counter.value();
                counter.advance()?;

                log::debug!(
                    "[session] Build plaintext message to {addr} of type {} and protocol {} on exchange {} with counter {}",
                    payload_header.message_type,
                    payload_header.protocol_id,
                    payload_header.exchange_id,
                    packet_header.counter,
                );
            }
        }

        packet_header.encode_before_data(&mut message);
        Ok(EncryptedPacketBuffer::mark_encrypted(message))
    }

    /// Hand a prepared message to the transport.
    pub fn send_prepared_message(
        &mut self,
        session:  &SessionHandle,
        prepared: &EncryptedPacketBuffer,
    ) -> Result<(), Error> {
        if self.state != State::Initialized {
            return Err(Error::IncorrectState);
        }
        if prepared.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if prepared.has_chained_buffer() {
            return Err(Error::InvalidMessageLength);
        }

        let now = self.now();
        let destination = match session {
            SessionHandle::Secure { peer_node_id, .. } => {
                let Some(idx) = self.lookup(session) else {
                    log::error!("[session] Could not find a valid secure session for {peer_node_id:#018x}");
                    return Err(Error::NotConnected);
                };
                self.peer_connections.mark_active(idx, now);
                let state = self.peer_connections.get(idx).ok_or(Error::NotConnected)?;
                log::debug!("[session] Sending encrypted msg to {peer_node_id:#018x} at {}", state.peer_address());
                *state.peer_address()
            }
            SessionHandle::Unauthenticated(addr) => {
                if let Some(idx) = self.unauthenticated.find(addr) {
                    self.unauthenticated.mark_active(idx, now);
                }
                log::debug!("[session] Sending plaintext msg to {addr}");
                *addr
            }
        };

        let Some(transport) = self.transport.as_mut() else {
            log::error!("[session] Transport is not initialized, unable to send the message");
            return Err(Error::IncorrectState);
        };
        transport.send_message(&destination, prepared.cast_to_writable())
    }

    // ─── Expiry ──────────────────────────────────────────────────────────────

    fn handle_connection_expired(
        delegate:     &mut Option<Box<dyn SessionMgrDelegate>>,
        transport:    &mut Option<Box<dyn TransportMgr>>,
        counter_sync: &mut Option<Box<dyn CounterSyncManager>>,
        state:        &PeerConnectionState,
    ) {
        log::debug!(
            "[session] Marking secure session {} for node {:#018x} as expired",
            state.local_session_id(),
            state.peer_node_id()
        );
        let handle = state.handle();
        if let Some(sync) = counter_sync.as_mut() {
            sync.drop_session(&handle);
        }
        if let Some(d) = delegate.as_mut() {
            d.on_connection_expired(&handle);
        }
        if let Some(t) = transport.as_mut() {
            t.disconnect(state.peer_address());
        }
    }

    fn expire_slot(&mut self, idx: usize) {
        let (delegate, transport, sync) = (&mut self.delegate, &mut self.transport, &mut self.counter_sync);
        self.peer_connections
            .mark_expired(idx, |s| Self::handle_connection_expired(delegate, transport, sync, s));
    }

    /// Expire the session behind `session`, if any.
    pub fn expire_pairing(&mut self, session: &SessionHandle) {
        if let Some(idx) = self.lookup(session) {
            self.expire_slot(idx);
        }
    }

    /// Expire every session with `peer_node_id` on `fabric`.
    pub fn expire_all_pairings(&mut self, peer_node_id: NodeId, fabric: FabricIndex) {
        let mut cursor = None;
        while let Some(idx) = self.peer_connections.find_next(peer_node_id, cursor) {
            if self.peer_connections.get(idx).is_some_and(|s| s.fabric_index() == fabric) {
                self.expire_slot(idx);
            }
            cursor = Some(idx);
        }
    }

    /// Expire every session on `fabric`.
    pub fn expire_all_pairings_for_fabric(&mut self, fabric: FabricIndex) {
        log::debug!("[session] Expiring all sessions for fabric {fabric}");
        let mut cursor = None;
        while let Some(idx) = self.peer_connections.find_next_by_fabric(fabric, cursor) {
            self.expire_slot(idx);
            cursor = Some(idx);
        }
    }

    fn schedule_expiry_timer(&mut self) {
        let delay = self.config.timeout_check_frequency;
        let Some(layer) = self.system_layer.as_mut() else { return };
        if let Err(e) = layer.start_timer(delay, TimerId::SessionExpiry) {
            log::error!("[session] Failed to arm the session expiry timer: {e}");
            panic!("session expiry timer could not be armed: {e}");
        }
    }

    /// Run the idle sweep (when rekeying is supported), give up on counter
    /// sync requests nobody answered, and re-arm the timer.
    ///
    /// The event loop calls this when [`TimerId::SessionExpiry`] fires.
    pub fn on_expiry_timer(&mut self) {
        if self.state != State::Initialized {
            return;
        }
        let now = self.now();
        if self.config.rekeying_supported {
            let timeout = self.config.peer_connection_timeout;
            let (delegate, transport, sync) = (&mut self.delegate, &mut self.transport, &mut self.counter_sync);
            self.peer_connections
                .expire_inactive(timeout, now, |s| Self::handle_connection_expired(delegate, transport, sync, s));
        }
        if let Some(sync) = self.counter_sync.as_mut() {
            sync.expire_stale_requests(now);
        }
        self.schedule_expiry_timer();
    }

    // ─── Pairing ─────────────────────────────────────────────────────────────

    /// Admit a secure session produced by a completed pairing.
    ///
    /// An existing session for the same peer and local session id is
    /// expired first; its expiry callback fires before the new session can
    /// be looked up.
    pub fn new_pairing(
        &mut self,
        peer_address: Option<PeerAddress>,
        peer_node_id: NodeId,
        pairing:      &dyn PairingSession,
        role:         SessionRole,
        fabric:       FabricIndex,
    ) -> Result<SessionHandle, Error> {
        let local_session_id = pairing.local_session_id();
        let peer_session_id  = pairing.peer_session_id();

        if let Some(idx) = self.peer_connections.find_by_local_key(Some(peer_node_id), local_session_id) {
            self.expire_slot(idx);
        }

        log::debug!("[session] New secure session created for node {peer_node_id:#018x}, key {peer_session_id}");
        let now = self.now();
        let idx = match self.peer_connections.allocate(peer_node_id, peer_session_id, local_session_id, now) {
            Ok(idx) => idx,
            Err(Error::CapacityExceeded) => return Err(Error::NoMemory),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.admit(idx, peer_address, pairing, role, fabric) {
            self.peer_connections.release(idx);
            return Err(e);
        }

        let handle = SessionHandle::secure(peer_node_id, local_session_id, peer_session_id, fabric);
        if let Some(d) = self.delegate.as_mut() {
            d.on_new_connection(&handle);
        }
        Ok(handle)
    }

    fn admit(
        &mut self,
        idx:          usize,
        peer_address: Option<PeerAddress>,
        pairing:      &dyn PairingSession,
        role:         SessionRole,
        fabric:       FabricIndex,
    ) -> Result<(), Error> {
        let state = self.peer_connections.get_mut(idx).ok_or(Error::NoMemory)?;
        state.set_fabric_index(fabric);

        match peer_address {
            Some(addr) if !addr.is_any_ip() => state.set_peer_address(addr),
            Some(addr) if addr.transport_type() == TransportType::Ble => state.set_peer_address(addr),
            Some(addr) if matches!(addr.transport_type(), TransportType::Udp | TransportType::Tcp) => {
                log::error!("[session] Refusing pairing with unroutable address {addr}");
                return Err(Error::InvalidArgument);
            }
            _ => {}
        }

        pairing.derive_secure_session(state.crypto_mut(), role)?;
        if let Some(counter) = pairing.peer_counter() {
            state.counters_mut().peer_message_counter().set_counter(counter);
        }
        Ok(())
    }

    /// Mark `session`'s peer counter as known and replay the messages that
    /// were parked while it was not.
    pub fn on_peer_counter_synchronized(&mut self, session: &SessionHandle, counter: u32) -> Result<(), Error> {
        let idx = self.lookup(session).ok_or(Error::NotConnected)?;
        let state = self.peer_connections.get_mut(idx).ok_or(Error::NotConnected)?;
        state.counters_mut().peer_message_counter().set_counter(counter);

        let queued = self.counter_sync.as_mut().map(|s| s.take_queued(session)).unwrap_or_default();
        log::debug!("[session] Peer counter synchronized at {counter}, replaying {} message(s)", queued.len());
        for m in queued {
            self.secure_message_dispatch(&m.packet_header, &m.source, m.payload);
        }
        Ok(())
    }

    // ─── Inbound ─────────────────────────────────────────────────────────────

    /// Entry point for every datagram the transport receives.
    ///
    /// Malformed input is logged and dropped; nothing here fails the caller.
    pub fn on_message_received(&mut self, source: &PeerAddress, mut msg: PacketBuffer) {
        if self.state != State::Initialized {
            log::warn!("[session] Dropping message from {source}: session manager not initialized");
            return;
        }
        let packet_header = match PacketHeader::decode_and_consume(&mut msg) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("[session] Dropping malformed message from {source}: {e}");
                return;
            }
        };

        if packet_header.is_encrypted() {
            self.secure_message_dispatch(&packet_header, source, msg);
        } else {
            self.message_dispatch(&packet_header, source, msg);
        }
    }

    fn message_dispatch(&mut self, packet_header: &PacketHeader, source: &PeerAddress, mut msg: PacketBuffer) {
        let now = self.now();
        let Some(idx) = self.unauthenticated.find_or_allocate(source, now) else {
            log::error!("[session] Unauthenticated sessions exhausted, dropping message from {source}");
            return;
        };
        let Some(session) = self.unauthenticated.get_mut(idx) else { return };

        let mut duplicate = DuplicateMessage::No;
        match session.peer_message_counter().verify_or_trust_first(packet_header.counter) {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                log::debug!("[session] Received a duplicate message with counter {}", packet_header.counter);
                duplicate = DuplicateMessage::Yes;
            }
            Err(e) => {
                log::error!("[session] Unexpected counter state for {source}: {e}");
                return;
            }
        }

        self.unauthenticated.mark_active(idx, now);

        let payload_header = match PayloadHeader::decode_and_consume(&mut msg) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("[session] Dropping plaintext message from {source} with bad payload header: {e}");
                return;
            }
        };

        if let Some(session) = self.unauthenticated.get_mut(idx) {
            session.peer_message_counter().commit(packet_header.counter);
        }

        if let Some(d) = self.delegate.as_mut() {
            let handle = SessionHandle::Unauthenticated(*source);
            d.on_message_received(packet_header, &payload_header, &handle, source, duplicate, msg);
        }
    }

    fn secure_message_dispatch(&mut self, packet_header: &PacketHeader, source: &PeerAddress, msg: PacketBuffer) {
        if let Err(e) = self.try_secure_message_dispatch(packet_header, source, msg) {
            if let Some(d) = self.delegate.as_mut() {
                d.on_receive_error(&e, source);
            }
        }
    }

    fn try_secure_message_dispatch(
        &mut self,
        packet_header: &PacketHeader,
        source:        &PeerAddress,
        mut msg:       PacketBuffer,
    ) -> Result<(), Error> {
        let Some(idx) = self.peer_connections.find_by_session_id(packet_header.session_id) else {
            log::error!("[session] Data received on an unknown session ({}), dropping it", packet_header.session_id);
            return Err(Error::KeyNotFoundFromPeer);
        };

        // Control messages carry their own counter class, which is not
        // tracked on receive yet; they bypass replay checks entirely.
        let control = packet_header.is_secure_session_control_msg();
        let mut duplicate = DuplicateMessage::No;
        if !control {
            let now = self.now();
            let state = self.peer_connections.get(idx).ok_or(Error::KeyNotFoundFromPeer)?;
            if !state.peer_message_counter().is_synchronized() {
                let handle = state.handle();
                let sync = self.counter_sync.as_mut().ok_or(Error::IncorrectState)?;
                match sync.queue_received_message_and_start_sync(packet_header, handle, state, source, msg, now) {
                    Ok(()) => log::debug!("[session] Message queued until the peer counter is synchronized"),
                    Err(e) => log::error!("[session] Failed to queue message for counter sync: {e}"),
                }
                return Ok(());
            }

            match state.peer_message_counter().verify(packet_header.counter) {
                Ok(()) => {}
                Err(e) if e.is_duplicate() => {
                    log::debug!("[session] Received a duplicate message with counter {}", packet_header.counter);
                    duplicate = DuplicateMessage::Yes;
                }
                Err(e) => {
                    log::error!("[session] Message counter verify failed: {e}");
                    return Err(e);
                }
            }
        }

        let now = self.now();
        self.peer_connections.mark_active(idx, now);

        let state = self.peer_connections.get_mut(idx).ok_or(Error::KeyNotFoundFromPeer)?;
        let payload_header = match self.codec.decode(state.crypto(), packet_header, &mut msg) {
            Ok(h) => h,
            Err(e) => {
                log::error!("[session] Secure message from {source} failed to decode, discarding: {e}");
                return Ok(());
            }
        };

        if duplicate == DuplicateMessage::Yes && !payload_header.needs_ack() {
            return Ok(());
        }

        if !control {
            state.counters_mut().peer_message_counter().commit(packet_header.counter);
        }

        if state.peer_address() != source {
            log::info!("[session] Peer of session {} moved from {} to {source}", state.local_session_id(), state.peer_address());
            state.set_peer_address(*source);
        }

        let handle = state.handle();
        if let Some(d) = self.delegate.as_mut() {
            d.on_message_received(packet_header, &payload_header, &handle, source, duplicate, msg);
        }
        Ok(())
    }
}
