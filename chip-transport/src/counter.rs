//! Message counters: local send counters and the peer anti-replay window.

use crate::error::Error;

/// Number of counters below the high-water mark that are still tracked
/// individually. Anything older is treated as a duplicate.
pub const MSG_COUNTER_WINDOW_SIZE: u32 = 32;

/// Value every freshly created local counter starts at.
pub const INITIAL_MESSAGE_COUNTER: u32 = 1;

// ─── MessageCounter ───────────────────────────────────────────────────────────

/// A monotonic local send counter.
///
/// The value is stamped into the next outgoing message, then advanced. It
/// never wraps: once it reaches `u32::MAX` every further advance fails with
/// [`Error::CounterExhausted`] and the session must be re-established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageCounter {
    value: u32,
}

impl MessageCounter {
    /// A counter starting at [`INITIAL_MESSAGE_COUNTER`].
    pub fn new() -> Self { Self { value: INITIAL_MESSAGE_COUNTER } }

    /// A counter starting at `value`.
    pub fn with_value(value: u32) -> Self { Self { value } }

    /// The value the next message will carry.
    pub fn value(&self) -> u32 { self.value }

    /// Move to the next value.
    pub fn advance(&mut self) -> Result<(), Error> {
        self.value = self.value.checked_add(1).ok_or(Error::CounterExhausted)?;
        Ok(())
    }
}

impl Default for MessageCounter {
    fn default() -> Self { Self::new() }
}

// ─── PeerMessageCounter ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum Status {
    NotSynced,
    Synced {
        max_counter: u32,
        /// Bit `i` set ⇔ `max_counter - (i + 1)` was already accepted.
        window:      u32,
    },
}

/// Receive-side tracker for one peer's counter.
///
/// Starts unsynchronized. A secure session is synchronized either by the
/// pairing handshake or by the counter-sync exchange; an unauthenticated
/// session trusts the first counter it sees.
///
/// Verification and commit are separate steps so a message is only
/// recorded as seen after it has been fully accepted (decrypted).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerMessageCounter {
    status: Status,
}

impl PeerMessageCounter {
    /// An unsynchronized tracker.
    pub fn new() -> Self { Self { status: Status::NotSynced } }

    /// True once a trusted counter value is known.
    pub fn is_synchronized(&self) -> bool { matches!(self.status, Status::Synced { .. }) }

    /// Highest counter accepted so far.
    pub fn max_counter(&self) -> Option<u32> {
        match self.status {
            Status::Synced { max_counter, .. } => Some(max_counter),
            Status::NotSynced                   => None,
        }
    }

    /// Synchronize to `value`. `value` itself counts as seen; the window below
    /// it starts empty, so counters within [`MSG_COUNTER_WINDOW_SIZE`] of it
    /// are still accepted once.
    pub fn set_counter(&mut self, value: u32) {
        self.status = Status::Synced { max_counter: value, window: 0 };
    }

    /// Forget the synchronized state.
    pub fn reset(&mut self) { self.status = Status::NotSynced; }

    /// Check `counter` against the window without recording it.
    ///
    /// Returns [`Error::DuplicateMessageReceived`] for a replay or a counter
    /// too far behind the window, and [`Error::IncorrectState`] if the
    /// tracker is not synchronized.
    pub fn verify(&self, counter: u32) -> Result<(), Error> {
        let Status::Synced { max_counter, window } = self.status else {
            return Err(Error::IncorrectState);
        };
        if counter > max_counter {
            return Ok(());
        }
        let offset = max_counter - counter;
        if offset == 0 || offset > MSG_COUNTER_WINDOW_SIZE {
            return Err(Error::DuplicateMessageReceived);
        }
        if window & (1u32 << (offset - 1)) != 0 {
            return Err(Error::DuplicateMessageReceived);
        }
        Ok(())
    }

    /// Like [`verify`](Self::verify), but an unsynchronized tracker accepts
    /// any value and becomes synchronized on it.
    pub fn verify_or_trust_first(&mut self, counter: u32) -> Result<(), Error> {
        if !self.is_synchronized() {
            self.set_counter(counter);
            return Ok(());
        }
        self.verify(counter)
    }

    /// Record `counter` as accepted.
    pub fn commit(&mut self, counter: u32) {
        let Status::Synced { max_counter, window } = &mut self.status else {
            return;
        };
        if counter > *max_counter {
            let shift = counter - *max_counter;
            *window = if shift > MSG_COUNTER_WINDOW_SIZE {
                0
            } else if shift == MSG_COUNTER_WINDOW_SIZE {
                1u32 << (shift - 1)
            } else {
                (*window << shift) | (1u32 << (shift - 1))
            };
            *max_counter = counter;
        } else {
            let offset = *max_counter - counter;
            if offset > 0 && offset <= MSG_COUNTER_WINDOW_SIZE {
                *window |= 1u32 << (offset - 1);
            }
        }
    }
}

impl Default for PeerMessageCounter {
    fn default() -> Self { Self::new() }
}

// ─── SessionMessageCounter ────────────────────────────────────────────────────

/// All counters belonging to one secure session.
///
/// Data and session-control messages use independent local counters so a
/// counter-sync exchange never consumes data counter values.
#[derive(Clone, Debug, Default)]
pub struct SessionMessageCounter {
    local:         MessageCounter,
    local_control: MessageCounter,
    peer:          PeerMessageCounter,
}

impl SessionMessageCounter {
    /// Fresh counters; the peer side starts unsynchronized.
    pub fn new() -> Self { Self::default() }

    /// Local counter for data messages.
    pub fn local_message_counter(&mut self) -> &mut MessageCounter { &mut self.local }

    /// Local counter for session control messages.
    pub fn local_control_counter(&mut self) -> &mut MessageCounter { &mut self.local_control }

    /// The peer receive tracker.
    pub fn peer_message_counter(&mut self) -> &mut PeerMessageCounter { &mut self.peer }

    /// Read-only view of the peer receive tracker.
    pub fn peer(&self) -> &PeerMessageCounter { &self.peer }

    /// Read-only view of the data counter.
    pub fn local(&self) -> &MessageCounter { &self.local }
}
