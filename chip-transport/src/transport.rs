//! Pluggable transport and timer layers.
//!
//! Implement [`TransportMgr`] over UDP, BLE or any other datagram service to
//! get session framing and anti-replay for free. Received datagrams are fed
//! back with [`crate::SessionManager::on_message_received`].

use std::time::{Duration, Instant};

use crate::buffer::PacketBuffer;
use crate::error::Error;
use crate::peer_address::PeerAddress;

/// An unreliable, connectionless datagram transport.
pub trait TransportMgr {
    /// Hand one fully framed message to the transport.
    fn send_message(&mut self, destination: &PeerAddress, message: PacketBuffer) -> Result<(), Error>;

    /// Drop any transport-level state kept for `address`.
    fn disconnect(&mut self, address: &PeerAddress);
}

/// Timers the session manager can arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Periodic idle-session sweep; fire with
    /// [`crate::SessionManager::on_expiry_timer`].
    SessionExpiry,
}

/// The event loop the session manager runs on.
pub trait SystemLayer {
    /// Arm a one-shot timer. Re-arming a pending timer replaces it.
    fn start_timer(&mut self, delay: Duration, timer: TimerId) -> Result<(), Error>;

    /// Disarm a timer; a no-op if it is not pending.
    fn cancel_timer(&mut self, timer: TimerId);

    /// Monotonic time used for session activity tracking.
    fn now(&self) -> Instant { Instant::now() }
}
