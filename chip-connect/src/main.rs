//! Loopback demo of the CHIP session layer.
//!
//! # What this does
//!
//! 1. Binds two UDP sockets on 127.0.0.1: a *controller* and a *device*
//! 2. Gives each its own `SessionManager`
//! 3. Pairs them with a pre-shared secret (controller = initiator)
//! 4. Sends one plaintext message, then encrypted messages both ways
//! 5. Replays an encrypted datagram to show the anti-replay window at work
//!
//! # Run
//! ```text
//! RUST_LOG=chip_transport=debug cargo run -p chip-connect
//! ```

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chip_crypto::SessionRole;
use chip_transport::{
    DuplicateMessage, Error, MessageCounterSync, NodeId, PacketBuffer, PacketHeader, PayloadHeader,
    PeerAddress, SessionHandle, SessionManager, SessionManagerConfig, SessionMgrDelegate,
    SharedSecretPairing, SyncRequestSender, SystemLayer, TimerId, TransportMgr,
};
use tokio::net::UdpSocket;

const CONTROLLER_NODE_ID: NodeId = 0x0000_0000_0001_b669;
const DEVICE_NODE_ID:     NodeId = 0x0000_0000_0000_1234;
const FABRIC:             u8     = 1;
const ECHO_PROTOCOL:      u16    = 0x0002;
const MAX_DATAGRAM:       usize  = 1280;

// ── Transport over tokio UDP ──────────────────────────────────────────────────

struct UdpTransport(Rc<UdpSocket>);

impl TransportMgr for UdpTransport {
    fn send_message(&mut self, destination: &PeerAddress, message: PacketBuffer) -> Result<(), Error> {
        let Some(to) = destination.socket_addr() else {
            return Err(Error::InvalidArgument);
        };
        self.0.try_send_to(message.as_ref(), to)?;
        Ok(())
    }

    fn disconnect(&mut self, address: &PeerAddress) {
        log::info!("[connect] transport state for {address} dropped");
    }
}

// ── Timer backed by the receive loop ──────────────────────────────────────────

/// The loop sleeps until the stored deadline and then calls
/// `SessionManager::on_expiry_timer`.
struct LoopTimer(Rc<Cell<Option<Instant>>>);

impl SystemLayer for LoopTimer {
    fn start_timer(&mut self, delay: Duration, _: TimerId) -> Result<(), Error> {
        self.0.set(Some(Instant::now() + delay));
        Ok(())
    }

    fn cancel_timer(&mut self, _: TimerId) { self.0.set(None); }
}

// ── Upper layer ───────────────────────────────────────────────────────────────

struct Inbox {
    name:     &'static str,
    received: Rc<RefCell<Vec<(SessionHandle, Vec<u8>)>>>,
}

impl SessionMgrDelegate for Inbox {
    fn on_new_connection(&mut self, session: &SessionHandle) {
        println!("[{}] new secure session {session:?}", self.name);
    }

    fn on_message_received(
        &mut self,
        packet_header:  &PacketHeader,
        payload_header: &PayloadHeader,
        session:        &SessionHandle,
        source:         &PeerAddress,
        duplicate:      DuplicateMessage,
        payload:        PacketBuffer,
    ) {
        let kind = if session.is_secure() { "encrypted" } else { "plaintext" };
        println!(
            "[{}] {kind} msg #{} from {source} (type {:#04x}{}): {:?}",
            self.name,
            packet_header.counter,
            payload_header.message_type,
            if duplicate == DuplicateMessage::Yes { ", duplicate" } else { "" },
            String::from_utf8_lossy(payload.as_ref()),
        );
        self.received.borrow_mut().push((session.clone(), payload.to_vec()));
    }

    fn on_connection_expired(&mut self, session: &SessionHandle) {
        println!("[{}] session expired {session:?}", self.name);
    }

    fn on_receive_error(&mut self, error: &Error, source: &PeerAddress) {
        println!("[{}] receive error from {source}: {error}", self.name);
    }
}

/// Both sides share the pairing counter, so a sync is never needed here.
struct NoSync;

impl SyncRequestSender for NoSync {
    fn send_sync_request(&mut self, session: &SessionHandle, _: [u8; 8]) -> Result<(), Error> {
        log::warn!("[connect] unexpected counter sync request for {session:?}");
        Ok(())
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

struct Node {
    mgr:      SessionManager,
    socket:   Rc<UdpSocket>,
    addr:     PeerAddress,
    timer:    Rc<Cell<Option<Instant>>>,
    received: Rc<RefCell<Vec<(SessionHandle, Vec<u8>)>>>,
}

impl Node {
    async fn bind(name: &'static str) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Rc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let addr = PeerAddress::udp(socket.local_addr()?);
        let timer = Rc::new(Cell::new(None));
        let received = Rc::new(RefCell::new(Vec::new()));

        let mut mgr = SessionManager::new(SessionManagerConfig::default());
        mgr.init(
            Box::new(LoopTimer(timer.clone())),
            Box::new(UdpTransport(socket.clone())),
            Box::new(MessageCounterSync::new(Box::new(NoSync))),
        )?;
        mgr.set_delegate(Box::new(Inbox { name, received: received.clone() }));

        println!("[{name}] listening on {addr}");
        Ok(Self { mgr, socket, addr, timer, received })
    }

    fn send(&mut self, session: &SessionHandle, message_type: u8, text: &str) -> Result<Vec<u8>, Error> {
        let header = PayloadHeader::new(ECHO_PROTOCOL, message_type).with_initiator(true);
        let prepared = self.mgr.prepare_message(session, &header, PacketBuffer::from_payload(text.as_bytes()))?;
        self.mgr.send_prepared_message(session, &prepared)?;
        Ok(prepared.as_bytes().to_vec())
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        self.mgr.on_message_received(&PeerAddress::udp(from), PacketBuffer::from(bytes.to_vec()));
    }

    fn fire_timer_if_due(&mut self) {
        if self.timer.get().is_some_and(|at| at <= Instant::now()) {
            self.timer.set(None);
            self.mgr.on_expiry_timer();
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None     => std::future::pending().await,
    }
}

/// Feed datagrams into both managers until `done` holds or `limit` passes.
/// Returns `false` if the time ran out first.
async fn pump<F>(a: &mut Node, b: &mut Node, limit: Duration, done: F) -> Result<bool, Box<dyn std::error::Error>>
where
    F: Fn(&Node, &Node) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    let mut buf_a = [0u8; MAX_DATAGRAM];
    let mut buf_b = [0u8; MAX_DATAGRAM];
    while !done(a, b) {
        let (sock_a, sock_b) = (a.socket.clone(), b.socket.clone());
        tokio::select! {
            r = sock_a.recv_from(&mut buf_a) => {
                let (n, from) = r?;
                a.on_datagram(&buf_a[..n], from);
            }
            r = sock_b.recv_from(&mut buf_b) => {
                let (n, from) = r?;
                b.on_datagram(&buf_b[..n], from);
            }
            _ = sleep_until(a.timer.get()) => a.fire_timer_if_due(),
            _ = sleep_until(b.timer.get()) => b.fire_timer_if_due(),
            _ = tokio::time::sleep_until(deadline) => return Ok(false),
        }
    }
    Ok(true)
}

/// Like [`pump`], but running out of time is an error.
async fn pump_until<F>(a: &mut Node, b: &mut Node, done: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: Fn(&Node, &Node) -> bool,
{
    if !pump(a, b, Duration::from_secs(5), done).await? {
        return Err("timed out waiting for messages".into());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("chip_transport=info,connect=info"))
        .init();

    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut controller = Node::bind("controller").await?;
    let mut device     = Node::bind("device").await?;

    // ── Plaintext ────────────────────────────────────────────────────────────
    let to_device = SessionHandle::Unauthenticated(device.addr);
    controller.send(&to_device, 0x01, "hello over plaintext")?;
    pump_until(&mut controller, &mut device, |_, d| d.received.borrow().len() == 1).await?;

    // ── Pairing ──────────────────────────────────────────────────────────────
    let secret = b"loopback demo pre-shared secret".to_vec();
    let salt   = b"chip-connect".to_vec();
    let controller_session = controller.mgr.new_pairing(
        Some(device.addr),
        DEVICE_NODE_ID,
        &SharedSecretPairing {
            local_session_id: 1,
            peer_session_id:  2,
            peer_counter:     Some(0),
            secret:           secret.clone(),
            salt:             salt.clone(),
        },
        SessionRole::Initiator,
        FABRIC,
    )?;
    let device_session = device.mgr.new_pairing(
        Some(controller.addr),
        CONTROLLER_NODE_ID,
        &SharedSecretPairing { local_session_id: 2, peer_session_id: 1, peer_counter: Some(0), secret, salt },
        SessionRole::Responder,
        FABRIC,
    )?;

    // ── Encrypted ────────────────────────────────────────────────────────────
    let mut sent = Vec::new();
    for i in 1..=3 {
        sent.push(controller.send(&controller_session, 0x02, &format!("secure message {i}"))?);
    }
    pump_until(&mut controller, &mut device, |_, d| d.received.borrow().len() == 4).await?;

    device.send(&device_session, 0x03, "all three received")?;
    pump_until(&mut controller, &mut device, |c, _| c.received.borrow().len() == 1).await?;

    // ── Replay ───────────────────────────────────────────────────────────────
    if let (Some(first), Some(to)) = (sent.first(), device.addr.socket_addr()) {
        controller.socket.send_to(first, to).await?;
        let before = device.received.borrow().len();
        let delivered =
            pump(&mut controller, &mut device, Duration::from_millis(200), |_, d| d.received.borrow().len() > before)
                .await?;
        if !delivered {
            println!("[device] replayed datagram was dropped");
        }
    }

    controller.mgr.expire_pairing(&controller_session);
    device.mgr.expire_pairing(&device_session);
    controller.mgr.shutdown();
    device.mgr.shutdown();
    println!("✓ done");
    Ok(())
}
