//! Upper-layer callbacks.

use crate::buffer::PacketBuffer;
use crate::error::Error;
use crate::header::{PacketHeader, PayloadHeader};
use crate::peer_address::PeerAddress;
use crate::session::SessionHandle;

/// Whether a delivered message repeats a counter already accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateMessage {
    /// First delivery.
    No,
    /// Replay; deliver only so an acknowledgement can be re-sent.
    Yes,
}

/// Events raised by [`crate::SessionManager`].
///
/// Callbacks run synchronously on the manager's thread and must not block.
#[allow(unused_variables)]
pub trait SessionMgrDelegate {
    /// A secure session was admitted.
    fn on_new_connection(&mut self, session: &SessionHandle) {}

    /// A message was decoded and passed anti-replay checks.
    fn on_message_received(
        &mut self,
        packet_header:  &PacketHeader,
        payload_header: &PayloadHeader,
        session:        &SessionHandle,
        source:         &PeerAddress,
        duplicate:      DuplicateMessage,
        payload:        PacketBuffer,
    );

    /// A secure session was removed.
    fn on_connection_expired(&mut self, session: &SessionHandle) {}

    /// An inbound secure message was rejected.
    fn on_receive_error(&mut self, error: &Error, source: &PeerAddress) {}
}
