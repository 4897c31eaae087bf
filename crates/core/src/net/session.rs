use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::event::{DisconnectReason, EventQueue, ServerDescriptor, SessionEvent};

use super::error::{NetError, NetResult};
use super::listener::{ListenerRegistry, PacketCallback};
use super::protocol::{PROTOCOL_VERSION, Packet, PacketKind, PacketPayload, kind};
use super::socket::{LinkMetrics, NetworkStats, TransportSocket, rand_u64};

/// Granularity of the outbound loop's periodic wake. Bounds how late a
/// keepalive or watchdog check can fire.
const OUTBOUND_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    pub dead_peer_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            dead_peer_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionStage {
    Disconnected = 0,
    Connecting = 1,
    HandshakePending = 2,
    Established = 3,
    Authenticated = 4,
}

impl ConnectionStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::HandshakePending,
            3 => Self::Established,
            4 => Self::Authenticated,
            _ => Self::Disconnected,
        }
    }
}

/// Slow or periodic work executed by the outbound loop instead of the
/// caller's thread.
#[derive(Debug, Clone)]
pub enum SessionTask {
    PingServers(Vec<SocketAddr>),
}

enum OutboundWork {
    Packet(Packet),
    Task(SessionTask),
}

struct SessionShared {
    config: SessionConfig,
    running: AtomicBool,
    stage: AtomicU8,
    client_salt: AtomicU64,
    metrics: Arc<LinkMetrics>,
    outbound: Mutex<Option<Sender<OutboundWork>>>,
    events: EventQueue,
    last_attempted: Mutex<Option<ServerDescriptor>>,
}

impl SessionShared {
    fn stage(&self) -> ConnectionStage {
        ConnectionStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    fn set_stage(&self, stage: ConnectionStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    fn enqueue(&self, work: OutboundWork) -> NetResult<()> {
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(work).map_err(|_| NetError::NotConnected),
            None => Err(NetError::NotConnected),
        }
    }

    fn enqueue_packet(&self, packet: Packet) -> NetResult<()> {
        self.enqueue(OutboundWork::Packet(packet))
    }

    /// Marks the session dead without joining the workers. Used from
    /// worker threads and builtin listeners, which cannot join themselves;
    /// the finished handles are reaped by the next lifecycle call.
    fn teardown_flags(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.set_stage(ConnectionStage::Disconnected);
        *self.outbound.lock().unwrap() = None;
    }
}

#[derive(Default)]
struct WorkerSet {
    outbound: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

/// The single authoritative connection to a game server.
///
/// One instance is constructed at application startup and handed to every
/// collaborator that needs it. Two worker threads exist per live
/// connection: an outbound/maintenance loop and a blocking receive loop.
/// Listener callbacks never run on either of them; the application's frame
/// loop pumps them through [`SessionManager::process_incoming`].
pub struct SessionManager {
    shared: Arc<SessionShared>,
    registry: Arc<ListenerRegistry>,
    inbound_rx: Mutex<Option<Receiver<Packet>>>,
    workers: Mutex<WorkerSet>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        let shared = Arc::new(SessionShared {
            config,
            running: AtomicBool::new(false),
            stage: AtomicU8::new(ConnectionStage::Disconnected as u8),
            client_salt: AtomicU64::new(0),
            metrics: Arc::new(LinkMetrics::new()),
            events: EventQueue::new(),
            outbound: Mutex::new(None),
            last_attempted: Mutex::new(None),
        });

        let registry = Arc::new(ListenerRegistry::new());
        install_builtins(&shared, &registry);

        Self {
            shared,
            registry,
            inbound_rx: Mutex::new(None),
            workers: Mutex::new(WorkerSet::default()),
        }
    }

    /// Opens a connection, replacing any existing one. Returns once the
    /// socket is up and the handshake has been queued; completion is
    /// observed through received packets (and the event queue).
    pub fn connect(&self, address: &str, port: u16) -> NetResult<()> {
        let mut workers = self.workers.lock().unwrap();
        self.disconnect_locked(&mut workers, true);

        self.shared.metrics.reset();
        let socket = TransportSocket::connect(address, port, Arc::clone(&self.shared.metrics))?;
        let send_socket = socket.try_clone()?;
        let remote = socket.remote();

        let salt = rand_u64();
        self.shared.client_salt.store(salt, Ordering::Relaxed);

        let (out_tx, out_rx) = channel();
        let (in_tx, in_rx) = channel();
        *self.shared.outbound.lock().unwrap() = Some(out_tx.clone());
        *self.inbound_rx.lock().unwrap() = Some(in_rx);

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_stage(ConnectionStage::Connecting);

        log::info!("connecting to {remote}");

        // Handshake goes out as the first queued packet.
        out_tx
            .send(OutboundWork::Packet(Packet::new(
                PacketPayload::HandshakeStart { client_salt: salt },
            )))
            .ok();
        self.shared.set_stage(ConnectionStage::HandshakePending);
        self.shared.events.push(SessionEvent::Connected { addr: remote });

        let shared = Arc::clone(&self.shared);
        workers.outbound = Some(std::thread::spawn(move || {
            outbound_loop(shared, out_rx, send_socket);
        }));

        let shared = Arc::clone(&self.shared);
        workers.receiver = Some(std::thread::spawn(move || {
            receive_loop(shared, in_tx, socket);
        }));

        Ok(())
    }

    /// Like [`connect`](Self::connect) but never returns an error: failures
    /// are reported through the event queue, and the attempted server is
    /// remembered for a later retry.
    pub fn connect_safe(&self, server: &ServerDescriptor) {
        *self.shared.last_attempted.lock().unwrap() = Some(server.clone());

        if let Err(error) = self.connect(&server.address, server.port) {
            log::warn!("connection to {} failed: {error}", server.name);
            self.shared.events.push(SessionEvent::ConnectionFailed {
                server: server.clone(),
                error,
            });
        }
    }

    /// Tears the connection down and joins both workers. Safe to call when
    /// already disconnected. When `quiet` is false the peer is notified of
    /// the graceful close first, best-effort.
    pub fn disconnect(&self, quiet: bool) {
        let mut workers = self.workers.lock().unwrap();
        self.disconnect_locked(&mut workers, quiet);
    }

    fn disconnect_locked(&self, workers: &mut WorkerSet, quiet: bool) {
        let was_active = workers.outbound.is_some() || workers.receiver.is_some();

        if !quiet && self.shared.stage() >= ConnectionStage::Established {
            let _ = self
                .shared
                .enqueue_packet(Packet::new(PacketPayload::Disconnect));
        }

        self.shared.running.store(false, Ordering::SeqCst);
        *self.shared.outbound.lock().unwrap() = None;

        if let Some(handle) = workers.outbound.take() {
            let _ = handle.join();
        }
        if let Some(handle) = workers.receiver.take() {
            let _ = handle.join();
        }

        // Drop any packets still queued for dispatch; no callback may fire
        // against a torn-down session.
        *self.inbound_rx.lock().unwrap() = None;
        self.shared.set_stage(ConnectionStage::Disconnected);

        if was_active {
            log::info!("disconnected");
        }
    }

    /// Queues a packet for the outbound loop. Packets enqueued from one
    /// thread reach the wire in enqueue order.
    pub fn send(&self, packet: Packet) -> NetResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(NetError::NotConnected);
        }
        self.shared.enqueue_packet(packet)
    }

    pub fn queue_task(&self, task: SessionTask) -> NetResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(NetError::NotConnected);
        }
        self.shared.enqueue(OutboundWork::Task(task))
    }

    /// Registers a callback for a packet kind, replacing any previous
    /// registration. Callbacks run only on the thread that calls
    /// [`process_incoming`](Self::process_incoming).
    pub fn add_listener<F>(&self, kind: PacketKind, callback: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.registry.add(kind, Arc::new(callback) as PacketCallback);
    }

    pub fn remove_listener(&self, kind: PacketKind) -> bool {
        self.registry.remove(kind)
    }

    pub fn remove_all_listeners(&self) {
        self.registry.clear_user();
    }

    /// Consumer-thread pump: drains the inbound queue and dispatches each
    /// packet, builtin listener first. Call once per frame.
    pub fn process_incoming(&self) {
        loop {
            let packet = {
                let guard = self.inbound_rx.lock().unwrap();
                match guard.as_ref() {
                    Some(rx) => rx.try_recv().ok(),
                    None => None,
                }
            };
            let Some(packet) = packet else { break };
            self.registry.dispatch(&packet);
        }
    }

    /// True if any connection has been made; the handshake may not have
    /// completed yet.
    pub fn connected(&self) -> bool {
        self.shared.stage() >= ConnectionStage::Connecting
    }

    /// True only once the server has acknowledged the handshake.
    pub fn established(&self) -> bool {
        self.shared.stage() >= ConnectionStage::Established
    }

    /// True once the identity proof has been accepted.
    pub fn authenticated(&self) -> bool {
        self.shared.stage() >= ConnectionStage::Authenticated
    }

    pub fn stage(&self) -> ConnectionStage {
        self.shared.stage()
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.shared.events.drain()
    }

    pub fn stats(&self) -> NetworkStats {
        self.shared.metrics.snapshot()
    }

    pub fn last_attempted_server(&self) -> Option<ServerDescriptor> {
        self.shared.last_attempted.lock().unwrap().clone()
    }
}

fn install_builtins(shared: &Arc<SessionShared>, registry: &Arc<ListenerRegistry>) {
    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::HANDSHAKE_CHALLENGE,
        Arc::new(move |packet| {
            let PacketPayload::HandshakeChallenge {
                server_salt,
                challenge,
            } = &packet.payload
            else {
                return;
            };
            let expected = s.client_salt.load(Ordering::Relaxed) ^ *server_salt;
            if *challenge != expected {
                log::warn!("handshake challenge mismatch, ignoring");
                return;
            }
            let _ = s.enqueue_packet(Packet::new(PacketPayload::HandshakeResponse {
                proof: expected,
            }));
        }),
    );

    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::HANDSHAKE_ACCEPTED,
        Arc::new(move |packet| {
            let PacketPayload::HandshakeAccepted { session_id } = &packet.payload else {
                return;
            };
            if s.stage() != ConnectionStage::HandshakePending {
                return;
            }
            log::info!("handshake complete, session {session_id}");
            s.set_stage(ConnectionStage::Established);
            s.events.push(SessionEvent::Established);
        }),
    );

    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::HANDSHAKE_DENIED,
        Arc::new(move |packet| {
            let PacketPayload::HandshakeDenied {
                reason,
                server_version,
            } = &packet.payload
            else {
                return;
            };
            let error = if *server_version != PROTOCOL_VERSION {
                NetError::ProtocolMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: *server_version,
                }
            } else {
                NetError::Handshake(reason.clone())
            };
            log::warn!("handshake denied: {error}");
            s.events.push(SessionEvent::SessionError { error });
            s.teardown_flags();
        }),
    );

    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::LOGIN_ACCEPTED,
        Arc::new(move |_| {
            if s.stage() != ConnectionStage::Established {
                return;
            }
            log::info!("login accepted");
            s.set_stage(ConnectionStage::Authenticated);
            s.events.push(SessionEvent::Authenticated);
        }),
    );

    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::LOGIN_DENIED,
        Arc::new(move |packet| {
            let PacketPayload::LoginDenied { reason } = &packet.payload else {
                return;
            };
            log::warn!("login denied: {reason}");
            s.events.push(SessionEvent::SessionError {
                error: NetError::Handshake(reason.clone()),
            });
            s.teardown_flags();
        }),
    );

    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::KEEPALIVE,
        Arc::new(move |packet| {
            let PacketPayload::Keepalive { timestamp } = &packet.payload else {
                return;
            };
            let _ = s.enqueue_packet(Packet::new(PacketPayload::KeepaliveAck {
                timestamp: *timestamp,
            }));
        }),
    );

    registry.add_builtin(
        kind::KEEPALIVE_ACK,
        Arc::new(|_| {
            log::trace!("keepalive acknowledged");
        }),
    );

    let s = Arc::clone(shared);
    registry.add_builtin(
        kind::DISCONNECT,
        Arc::new(move |_| {
            log::info!("server closed the connection");
            s.events.push(SessionEvent::Disconnected {
                reason: DisconnectReason::PeerClosed,
            });
            s.teardown_flags();
        }),
    );
}

/// Owns all writes to the wire: queued packets, maintenance tasks,
/// keepalive timing, and the dead-peer watchdog.
fn outbound_loop(
    shared: Arc<SessionShared>,
    rx: Receiver<OutboundWork>,
    mut socket: TransportSocket,
) {
    let mut next_ping_id: u32 = 0;

    while shared.running.load(Ordering::SeqCst) {
        if shared.metrics.since_recv() > shared.config.dead_peer_timeout {
            log::warn!(
                "nothing received for {:?}, dropping session",
                shared.config.dead_peer_timeout
            );
            shared.events.push(SessionEvent::SessionError {
                error: NetError::DeadPeerTimeout,
            });
            shared.teardown_flags();
            return;
        }

        match rx.recv_timeout(OUTBOUND_WAIT) {
            Ok(OutboundWork::Packet(packet)) => {
                if let Err(error) = socket.send_packet(&packet) {
                    log::warn!("send failed: {error}");
                    shared.events.push(SessionEvent::SessionError { error });
                    shared.teardown_flags();
                    return;
                }
            }
            Ok(OutboundWork::Task(task)) => run_task(&mut socket, &mut next_ping_id, task),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if shared.stage() >= ConnectionStage::Established
            && shared.metrics.since_send() >= shared.config.keepalive_interval
        {
            let _ = socket.send_packet(&Packet::new(PacketPayload::Keepalive {
                timestamp: shared.metrics.now_ms(),
            }));
        }
    }

    // Flush whatever was queued before the stop signal, so a graceful
    // close notification still reaches the peer.
    while let Ok(work) = rx.try_recv() {
        if let OutboundWork::Packet(packet) = work {
            let _ = socket.send_packet(&packet);
        }
    }
}

fn run_task(socket: &mut TransportSocket, next_ping_id: &mut u32, task: SessionTask) {
    match task {
        SessionTask::PingServers(addrs) => {
            for addr in addrs {
                let ping_id = *next_ping_id;
                *next_ping_id = next_ping_id.wrapping_add(1);
                if let Err(e) =
                    socket.send_packet_to(&Packet::new(PacketPayload::ServerPing { ping_id }), addr)
                {
                    log::debug!("ping to {addr} failed: {e}");
                }
            }
        }
    }
}

/// Owns all blocking reads: decodes datagrams and forwards session packets
/// to the consumer-thread dispatch queue. Pong replies to maintenance pings
/// may come from servers other than the session peer and go straight to the
/// event queue.
fn receive_loop(shared: Arc<SessionShared>, tx: Sender<Packet>, mut socket: TransportSocket) {
    let remote = socket.remote();

    while shared.running.load(Ordering::SeqCst) {
        match socket.recv_packet() {
            Ok(Some((packet, addr))) => {
                if let PacketPayload::ServerPong {
                    ping_id,
                    player_count,
                } = &packet.payload
                {
                    shared.events.push(SessionEvent::ServerPong {
                        addr,
                        ping_id: *ping_id,
                        player_count: *player_count,
                    });
                    continue;
                }

                if addr != remote {
                    log::debug!("ignoring packet from unknown peer {addr}");
                    continue;
                }

                if tx.send(packet).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(error) => {
                if shared.running.load(Ordering::SeqCst) {
                    log::warn!("receive failed: {error}");
                    shared.events.push(SessionEvent::SessionError { error });
                    shared.teardown_flags();
                }
                return;
            }
        }
    }
}
