//! Fixed-capacity table of secure session records.
//!
//! Records live in a slot array sized once at construction. Lookups return a
//! slot index; the index is also the cursor for the `find_next*` family, so
//! "visit every match" loops resume after the last slot they saw.

use std::time::{Duration, Instant};

use crate::error::Error;
use crate::session::{FabricIndex, NodeId, PeerConnectionState};

/// Bounded registry of [`PeerConnectionState`] records.
#[derive(Debug)]
pub struct PeerConnections {
    slots: Vec<Option<PeerConnectionState>>,
}

impl PeerConnections {
    /// A table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self { slots: std::iter::repeat_with(|| None).take(capacity).collect() }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize { self.slots.len() }

    /// Number of live records.
    pub fn len(&self) -> usize { self.slots.iter().filter(|s| s.is_some()).count() }

    /// True if no records are live.
    pub fn is_empty(&self) -> bool { self.slots.iter().all(Option::is_none) }

    /// Create a record in a free slot.
    ///
    /// Fails with [`Error::CapacityExceeded`] when every slot is taken and
    /// with [`Error::InvalidArgument`] if `local_session_id` is already in
    /// use; evicting is the caller's decision.
    pub fn allocate(
        &mut self,
        peer_node_id:     NodeId,
        peer_session_id:  u16,
        local_session_id: u16,
        now:              Instant,
    ) -> Result<usize, Error> {
        if self.find_by_session_id(local_session_id).is_some() {
            log::error!("[session] Local session id {local_session_id} already in use");
            return Err(Error::InvalidArgument);
        }
        let idx = self.slots.iter().position(Option::is_none).ok_or(Error::CapacityExceeded)?;
        self.slots[idx] = Some(PeerConnectionState::new(peer_node_id, peer_session_id, local_session_id, now));
        Ok(idx)
    }

    /// The record in slot `idx`.
    pub fn get(&self, idx: usize) -> Option<&PeerConnectionState> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// The record in slot `idx`, mutably.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut PeerConnectionState> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    /// Iterate live records.
    pub fn iter(&self) -> impl Iterator<Item = &PeerConnectionState> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    fn find_from<F>(&self, cursor: Option<usize>, pred: F) -> Option<usize>
    where
        F: Fn(&PeerConnectionState) -> bool,
    {
        let start = cursor.map_or(0, |c| c + 1);
        (start..self.slots.len()).find(|&i| self.slots[i].as_ref().is_some_and(&pred))
    }

    /// Exact match on local session id, optionally constrained to a peer.
    pub fn find_by_local_key(&self, peer_node_id: Option<NodeId>, local_session_id: u16) -> Option<usize> {
        self.find_from(None, |s| {
            s.local_session_id() == local_session_id
                && peer_node_id.is_none_or(|n| n == s.peer_node_id())
        })
    }

    /// Match on the session id carried on the wire (our local session id).
    pub fn find_by_session_id(&self, session_id: u16) -> Option<usize> {
        self.find_from(None, |s| s.local_session_id() == session_id)
    }

    /// Next record for `peer_node_id` after `cursor`.
    pub fn find_next(&self, peer_node_id: NodeId, cursor: Option<usize>) -> Option<usize> {
        self.find_from(cursor, |s| s.peer_node_id() == peer_node_id)
    }

    /// Next record on `fabric` after `cursor`.
    pub fn find_next_by_fabric(&self, fabric: FabricIndex, cursor: Option<usize>) -> Option<usize> {
        self.find_from(cursor, |s| s.fabric_index() == fabric)
    }

    /// Refresh the activity timestamp of slot `idx`.
    pub fn mark_active(&mut self, idx: usize, now: Instant) {
        if let Some(state) = self.get_mut(idx) {
            state.set_last_activity(now);
        }
    }

    /// Expire slot `idx`: `on_expired` sees the record, then it is removed.
    pub fn mark_expired<F>(&mut self, idx: usize, mut on_expired: F)
    where
        F: FnMut(&PeerConnectionState),
    {
        if let Some(state) = self.get(idx) {
            on_expired(state);
        }
        self.release(idx);
    }

    /// Remove slot `idx` without notifying anyone. Used to roll back a
    /// half-admitted record.
    pub(crate) fn release(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = None;
        }
    }

    /// Expire every record idle for longer than `max_idle`.
    pub fn expire_inactive<F>(&mut self, max_idle: Duration, now: Instant, mut on_expired: F)
    where
        F: FnMut(&PeerConnectionState),
    {
        let idle: Vec<usize> = (0..self.slots.len())
            .filter(|&i| {
                self.get(i)
                    .is_some_and(|s| now.saturating_duration_since(s.last_activity()) > max_idle)
            })
            .collect();
        for idx in idle {
            self.mark_expired(idx, &mut on_expired);
        }
    }
}
