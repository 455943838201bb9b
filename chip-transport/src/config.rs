//! Session manager configuration.

use std::time::Duration;

/// Tunables fixed for the lifetime of a [`crate::SessionManager`].
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    /// Slots in the secure session table.
    pub max_peer_connections:         usize,
    /// Slots in the unauthenticated session table.
    pub max_unauthenticated_sessions: usize,
    /// A secure session idle longer than this is expired by the sweep.
    pub peer_connection_timeout:      Duration,
    /// How often the expiry timer fires.
    pub timeout_check_frequency:      Duration,
    /// Run the idle sweep at all. Without rekeying, expiring a healthy idle
    /// session only forces a full re-pairing, so this defaults to off.
    pub rekeying_supported:           bool,
    /// An unauthenticated session must be idle at least this long before a
    /// new peer may reclaim its slot.
    pub unauthenticated_min_idle:     Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_peer_connections:         16,
            max_unauthenticated_sessions: 4,
            peer_connection_timeout:      Duration::from_secs(10 * 60),
            timeout_check_frequency:      Duration::from_secs(5),
            rekeying_supported:           false,
            unauthenticated_min_idle:     Duration::ZERO,
        }
    }
}
