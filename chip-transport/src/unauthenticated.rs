//! Fixed-capacity table of plaintext sessions.

use std::time::{Duration, Instant};

use crate::peer_address::PeerAddress;
use crate::session::UnauthenticatedSession;

/// Bounded registry of [`UnauthenticatedSession`]s keyed by peer address.
///
/// When full, the least recently active session is reclaimed, but only if it
/// has been idle for at least `min_idle`. Otherwise allocation fails, which
/// keeps an unauthenticated flood from displacing live handshakes.
#[derive(Debug)]
pub struct UnauthenticatedSessionTable {
    sessions: Vec<UnauthenticatedSession>,
    capacity: usize,
    min_idle: Duration,
}

impl UnauthenticatedSessionTable {
    /// A table holding at most `capacity` sessions.
    pub fn new(capacity: usize, min_idle: Duration) -> Self {
        Self { sessions: Vec::with_capacity(capacity), capacity, min_idle }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize { self.sessions.len() }

    /// True if no sessions are live.
    pub fn is_empty(&self) -> bool { self.sessions.is_empty() }

    /// Index of the session for `addr`.
    pub fn find(&self, addr: &PeerAddress) -> Option<usize> {
        self.sessions.iter().position(|s| s.peer_address() == addr)
    }

    /// Index of the session for `addr`, allocating (or reclaiming) one if needed.
    pub fn find_or_allocate(&mut self, addr: &PeerAddress, now: Instant) -> Option<usize> {
        if let Some(idx) = self.find(addr) {
            return Some(idx);
        }
        if self.sessions.len() < self.capacity {
            self.sessions.push(UnauthenticatedSession::new(*addr, now));
            return Some(self.sessions.len() - 1);
        }

        let (idx, lru) = self
            .sessions
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_activity())?;
        if now.saturating_duration_since(lru.last_activity()) < self.min_idle {
            return None;
        }
        log::debug!("[session] Reclaiming unauthenticated session for {}", lru.peer_address());
        self.sessions[idx] = UnauthenticatedSession::new(*addr, now);
        Some(idx)
    }

    /// The session at `idx`.
    pub fn get(&self, idx: usize) -> Option<&UnauthenticatedSession> { self.sessions.get(idx) }

    /// The session at `idx`, mutably.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut UnauthenticatedSession> { self.sessions.get_mut(idx) }

    /// Refresh the activity timestamp of `idx`.
    pub fn mark_active(&mut self, idx: usize, now: Instant) {
        if let Some(s) = self.sessions.get_mut(idx) {
            s.set_last_activity(now);
        }
    }
}
