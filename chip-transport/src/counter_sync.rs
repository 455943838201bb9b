//! Peer counter resynchronization.
//!
//! A secure session whose peer counter is unknown cannot judge replays, so
//! inbound messages are parked here while a counter-sync request goes out.
//! When the response arrives the upper layer calls
//! [`crate::SessionManager::on_peer_counter_synchronized`], which drains the
//! parked messages back through the normal receive path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::buffer::PacketBuffer;
use crate::error::Error;
use crate::header::PacketHeader;
use crate::peer_address::PeerAddress;
use crate::session::{PeerConnectionState, SessionHandle};

/// Default number of messages [`MessageCounterSync`] parks across all sessions.
pub const DEFAULT_SYNC_QUEUE_CAPACITY: usize = 8;

/// Length of the random challenge carried by a counter-sync request.
pub const SYNC_CHALLENGE_LENGTH: usize = 8;

/// How long [`MessageCounterSync`] waits for a sync response before it
/// gives up on the request and releases the parked messages.
pub const DEFAULT_SYNC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A message parked until its session's peer counter is known.
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    /// The session the message arrived on.
    pub session:       SessionHandle,
    /// Its (cleartext) packet header.
    pub packet_header: PacketHeader,
    /// Where it came from.
    pub source:        PeerAddress,
    /// The still-encrypted remainder of the message.
    pub payload:       PacketBuffer,
}

/// Drives counter resynchronization for unsynchronized sessions.
pub trait CounterSyncManager {
    /// Park a message and make sure a sync exchange is under way for its session.
    fn queue_received_message_and_start_sync(
        &mut self,
        packet_header: &PacketHeader,
        session:       SessionHandle,
        state:         &PeerConnectionState,
        source:        &PeerAddress,
        payload:       PacketBuffer,
        now:           Instant,
    ) -> Result<(), Error>;

    /// Remove and return every message parked for `session`, in arrival order.
    fn take_queued(&mut self, session: &SessionHandle) -> Vec<QueuedMessage>;

    /// Forget everything about `session`: its parked messages and any
    /// outstanding request. Called when the session expires.
    fn drop_session(&mut self, session: &SessionHandle);

    /// Abandon requests that have gone unanswered for too long, dropping
    /// their parked messages. The next message on such a session sends a
    /// fresh request.
    fn expire_stale_requests(&mut self, now: Instant);
}

/// Sends the actual counter-sync request on behalf of [`MessageCounterSync`].
pub trait SyncRequestSender {
    /// Send a sync request carrying `challenge` to the peer of `session`.
    fn send_sync_request(&mut self, session: &SessionHandle, challenge: [u8; SYNC_CHALLENGE_LENGTH]) -> Result<(), Error>;
}

struct PendingRequest {
    challenge: [u8; SYNC_CHALLENGE_LENGTH],
    sent_at:   Instant,
}

/// Bounded parking queue with at most one in-flight request per session.
pub struct MessageCounterSync {
    capacity:         usize,
    response_timeout: Duration,
    queue:            Vec<QueuedMessage>,
    in_flight:        HashMap<SessionHandle, PendingRequest>,
    sender:           Box<dyn SyncRequestSender>,
}

impl MessageCounterSync {
    /// A queue of [`DEFAULT_SYNC_QUEUE_CAPACITY`] messages.
    pub fn new(sender: Box<dyn SyncRequestSender>) -> Self {
        Self::with_capacity(DEFAULT_SYNC_QUEUE_CAPACITY, sender)
    }

    /// A queue of `capacity` messages.
    pub fn with_capacity(capacity: usize, sender: Box<dyn SyncRequestSender>) -> Self {
        Self {
            capacity,
            response_timeout: DEFAULT_SYNC_RESPONSE_TIMEOUT,
            queue: Vec::with_capacity(capacity),
            in_flight: HashMap::new(),
            sender,
        }
    }

    /// Wait `timeout` for a response before abandoning a request.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Number of parked messages.
    pub fn queued_len(&self) -> usize { self.queue.len() }

    /// The challenge of the outstanding request for `session`, used to
    /// match the response.
    pub fn pending_challenge(&self, session: &SessionHandle) -> Option<[u8; SYNC_CHALLENGE_LENGTH]> {
        self.in_flight.get(session).map(|p| p.challenge)
    }

    fn discard_queued(&mut self, session: &SessionHandle) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| &m.session != session);
        before - self.queue.len()
    }

    fn start_sync(&mut self, session: &SessionHandle, now: Instant) -> Result<(), Error> {
        if self.in_flight.contains_key(session) {
            return Ok(());
        }
        let mut challenge = [0u8; SYNC_CHALLENGE_LENGTH];
        getrandom::getrandom(&mut challenge).map_err(|e| {
            log::error!("[counter-sync] getrandom failed: {e}");
            Error::IncorrectState
        })?;
        self.sender.send_sync_request(session, challenge)?;
        self.in_flight.insert(session.clone(), PendingRequest { challenge, sent_at: now });
        log::debug!("[counter-sync] Sync request sent for {session:?}");
        Ok(())
    }
}

impl CounterSyncManager for MessageCounterSync {
    fn queue_received_message_and_start_sync(
        &mut self,
        packet_header: &PacketHeader,
        session:       SessionHandle,
        state:         &PeerConnectionState,
        source:        &PeerAddress,
        payload:       PacketBuffer,
        now:           Instant,
    ) -> Result<(), Error> {
        if self.queue.len() >= self.capacity {
            log::warn!(
                "[counter-sync] Queue full, dropping message {} for session {}",
                packet_header.counter,
                state.local_session_id()
            );
            return Err(Error::NoMemory);
        }
        self.start_sync(&session, now)?;
        self.queue.push(QueuedMessage {
            session,
            packet_header: packet_header.clone(),
            source: *source,
            payload,
        });
        Ok(())
    }

    fn take_queued(&mut self, session: &SessionHandle) -> Vec<QueuedMessage> {
        self.in_flight.remove(session);
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|m| &m.session == session);
        self.queue = rest;
        mine
    }

    fn drop_session(&mut self, session: &SessionHandle) {
        let had_request = self.in_flight.remove(session).is_some();
        let dropped = self.discard_queued(session);
        if had_request || dropped > 0 {
            log::debug!("[counter-sync] Dropped {dropped} parked message(s) for expired {session:?}");
        }
    }

    fn expire_stale_requests(&mut self, now: Instant) {
        let timeout = self.response_timeout;
        let stale: Vec<SessionHandle> = self
            .in_flight
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(s, _)| s.clone())
            .collect();
        for session in stale {
            self.in_flight.remove(&session);
            let dropped = self.discard_queued(&session);
            log::warn!("[counter-sync] No sync response for {session:?}, dropped {dropped} parked message(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<SessionHandle>>>);

    impl SyncRequestSender for Recorder {
        fn send_sync_request(&mut self, session: &SessionHandle, _: [u8; SYNC_CHALLENGE_LENGTH]) -> Result<(), Error> {
            self.0.borrow_mut().push(session.clone());
            Ok(())
        }
    }

    struct Failing;

    impl SyncRequestSender for Failing {
        fn send_sync_request(&mut self, _: &SessionHandle, _: [u8; SYNC_CHALLENGE_LENGTH]) -> Result<(), Error> {
            Err(Error::NotConnected)
        }
    }

    fn state(local: u16) -> PeerConnectionState {
        PeerConnectionState::new(1, local + 100, local, Instant::now())
    }

    fn header(counter: u32) -> PacketHeader {
        PacketHeader { counter, ..Default::default() }
    }

    #[test]
    fn one_request_per_session() {
        let rec = Recorder::default();
        let mut sync = MessageCounterSync::new(Box::new(rec.clone()));
        let s1 = state(1);
        let s2 = state(2);
        let src = PeerAddress::ble();

        sync.queue_received_message_and_start_sync(&header(1), s1.handle(), &s1, &src, PacketBuffer::default(), Instant::now()).unwrap();
        sync.queue_received_message_and_start_sync(&header(2), s1.handle(), &s1, &src, PacketBuffer::default(), Instant::now()).unwrap();
        sync.queue_received_message_and_start_sync(&header(3), s2.handle(), &s2, &src, PacketBuffer::default(), Instant::now()).unwrap();

        assert_eq!(*rec.0.borrow(), vec![s1.handle(), s2.handle()]);
        assert_eq!(sync.queued_len(), 3);
        assert!(sync.pending_challenge(&s1.handle()).is_some());
    }

    #[test]
    fn take_queued_drains_only_that_session() {
        let mut sync = MessageCounterSync::new(Box::new(Recorder::default()));
        let s1 = state(1);
        let s2 = state(2);
        let src = PeerAddress::ble();
        sync.queue_received_message_and_start_sync(&header(1), s1.handle(), &s1, &src, PacketBuffer::default(), Instant::now()).unwrap();
        sync.queue_received_message_and_start_sync(&header(2), s2.handle(), &s2, &src, PacketBuffer::default(), Instant::now()).unwrap();
        sync.queue_received_message_and_start_sync(&header(3), s1.handle(), &s1, &src, PacketBuffer::default(), Instant::now()).unwrap();

        let taken = sync.take_queued(&s1.handle());
        let counters: Vec<u32> = taken.iter().map(|m| m.packet_header.counter).collect();
        assert_eq!(counters, vec![1, 3]);
        assert_eq!(sync.queued_len(), 1);
        assert!(sync.pending_challenge(&s1.handle()).is_none());
        assert!(sync.pending_challenge(&s2.handle()).is_some());
    }

    #[test]
    fn full_queue_is_no_memory() {
        let mut sync = MessageCounterSync::with_capacity(1, Box::new(Recorder::default()));
        let s = state(1);
        let src = PeerAddress::ble();
        sync.queue_received_message_and_start_sync(&header(1), s.handle(), &s, &src, PacketBuffer::default(), Instant::now()).unwrap();
        let r = sync.queue_received_message_and_start_sync(&header(2), s.handle(), &s, &src, PacketBuffer::default(), Instant::now());
        assert!(matches!(r, Err(Error::NoMemory)));
    }

    #[test]
    fn failed_request_parks_nothing() {
        let mut sync = MessageCounterSync::new(Box::new(Failing));
        let s = state(1);
        let r = sync.queue_received_message_and_start_sync(&header(1), s.handle(), &s, &PeerAddress::ble(), PacketBuffer::default(), Instant::now());
        assert!(matches!(r, Err(Error::NotConnected)));
        assert_eq!(sync.queued_len(), 0);
        assert!(sync.pending_challenge(&s.handle()).is_none());
    }

    #[test]
    fn dropped_session_releases_queue_and_request() {
        let rec = Recorder::default();
        let mut sync = MessageCounterSync::with_capacity(2, Box::new(rec.clone()));
        let s1 = state(1);
        let s2 = state(2);
        let src = PeerAddress::ble();
        let now = Instant::now();
        sync.queue_received_message_and_start_sync(&header(1), s1.handle(), &s1, &src, PacketBuffer::default(), now).unwrap();
        sync.queue_received_message_and_start_sync(&header(2), s1.handle(), &s1, &src, PacketBuffer::default(), now).unwrap();

        sync.drop_session(&s1.handle());
        assert_eq!(sync.queued_len(), 0);
        assert!(sync.pending_challenge(&s1.handle()).is_none());

        // room again for another session, and the dropped one can start over
        sync.queue_received_message_and_start_sync(&header(3), s2.handle(), &s2, &src, PacketBuffer::default(), now).unwrap();
        sync.queue_received_message_and_start_sync(&header(4), s1.handle(), &s1, &src, PacketBuffer::default(), now).unwrap();
        assert_eq!(*rec.0.borrow(), vec![s1.handle(), s2.handle(), s1.handle()]);
    }

    #[test]
    fn unanswered_request_times_out() {
        let rec = Recorder::default();
        let mut sync = MessageCounterSync::new(Box::new(rec.clone())).with_response_timeout(Duration::from_secs(2));
        let s1 = state(1);
        let s2 = state(2);
        let src = PeerAddress::ble();
        let t0 = Instant::now();
        sync.queue_received_message_and_start_sync(&header(1), s1.handle(), &s1, &src, PacketBuffer::default(), t0).unwrap();
        let t1 = t0 + Duration::from_secs(1);
        sync.queue_received_message_and_start_sync(&header(1), s2.handle(), &s2, &src, PacketBuffer::default(), t1).unwrap();

        sync.expire_stale_requests(t0 + Duration::from_millis(1999));
        assert_eq!(sync.queued_len(), 2);

        sync.expire_stale_requests(t0 + Duration::from_secs(2));
        assert!(sync.pending_challenge(&s1.handle()).is_none());
        assert!(sync.pending_challenge(&s2.handle()).is_some());
        assert_eq!(sync.queued_len(), 1);

        let t2 = t0 + Duration::from_secs(2);
        sync.queue_received_message_and_start_sync(&header(2), s1.handle(), &s1, &src, PacketBuffer::default(), t2).unwrap();
        assert_eq!(rec.0.borrow().len(), 3);
    }
}
