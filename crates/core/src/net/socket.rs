use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::error::{NetError, NetResult};
use super::protocol::{MAX_PACKET_SIZE, Packet, PacketPayload, Reassembler, encode_frames};

/// How long a blocking receive waits before giving the caller a chance to
/// observe the running flag.
pub const RECV_POLL: Duration = Duration::from_millis(250);

/// Liveness stamps and transfer counters shared between both worker threads
/// and the session watchdog. All fields are atomic so the query side never
/// takes a lock.
#[derive(Debug)]
pub struct LinkMetrics {
    epoch: Instant,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn stamp_send(&self, bytes: u64) {
        self.last_send_ms.store(self.now_ms(), Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stamp_recv(&self, bytes: u64) {
        self.last_recv_ms.store(self.now_ms(), Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn since_send(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.last_send_ms.load(Ordering::Relaxed)))
    }

    pub fn since_recv(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.last_recv_ms.load(Ordering::Relaxed)))
    }

    /// Resets the stamps to "now" and zeroes the counters for a fresh
    /// connection.
    pub fn reset(&self) {
        let now = self.now_ms();
        self.last_send_ms.store(now, Ordering::Relaxed);
        self.last_recv_ms.store(now, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

pub struct TransportSocket {
    socket: UdpSocket,
    remote: SocketAddr,
    metrics: Arc<LinkMetrics>,
    reassembler: Reassembler,
    next_message_id: u32,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl TransportSocket {
    /// Resolves the server address and binds an ephemeral local socket.
    /// The socket stays unconnected so maintenance pings can reach other
    /// servers; session traffic is filtered by source address in the
    /// receive loop.
    pub fn connect(address: &str, port: u16, metrics: Arc<LinkMetrics>) -> NetResult<Self> {
        let remote = (address, port)
            .to_socket_addrs()
            .map_err(|_| NetError::AddressResolution {
                addr: format!("{address}:{port}"),
            })?
            .next()
            .ok_or_else(|| NetError::AddressResolution {
                addr: format!("{address}:{port}"),
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(RECV_POLL))?;

        Ok(Self {
            socket,
            remote,
            metrics,
            reassembler: Reassembler::new(),
            next_message_id: 0,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }

    /// Clones the underlying socket so the send and receive loops can run
    /// on separate threads. Reassembly state is not shared; only the
    /// receiving half ever sees fragments.
    pub fn try_clone(&self) -> NetResult<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            remote: self.remote,
            metrics: Arc::clone(&self.metrics),
            reassembler: Reassembler::new(),
            next_message_id: 0,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn send_packet(&mut self, packet: &Packet) -> NetResult<()> {
        self.send_packet_to(packet, self.remote)
    }

    pub fn send_packet_to(&mut self, packet: &Packet, addr: SocketAddr) -> NetResult<()> {
        let frames = encode_frames(packet, &mut self.next_message_id)?;
        for frame in frames {
            let bytes = self.socket.send_to(&frame, addr)?;
            self.metrics.stamp_send(bytes as u64);
        }
        Ok(())
    }

    /// Blocks for up to [`RECV_POLL`] waiting for one decodable packet.
    /// Returns `Ok(None)` on timeout; malformed datagrams are dropped and
    /// logged, never surfaced. Fragments are fed to the reassembler and
    /// only the completed packet comes out. Liveness is stamped only for
    /// traffic from the session peer.
    pub fn recv_packet(&mut self) -> NetResult<Option<(Packet, SocketAddr)>> {
        loop {
            let (size, addr) = match self.socket.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetError::Socket(e)),
            };

            let packet = match Packet::deserialize(&self.recv_buffer[..size]) {
                Ok(packet) if packet.is_valid() => packet,
                Ok(_) => {
                    log::debug!("dropping packet with invalid header from {addr}");
                    continue;
                }
                Err(e) => {
                    log::debug!("dropping undecodable datagram from {addr}: {e}");
                    continue;
                }
            };

            if addr == self.remote {
                self.metrics.stamp_recv(size as u64);
            }

            if let PacketPayload::Fragment {
                message_id,
                index,
                total,
                data,
            } = packet.payload
            {
                match self.reassembler.insert(message_id, index, total, data) {
                    Ok(Some(complete)) if complete.is_valid() => {
                        return Ok(Some((complete, addr)));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("dropping bad fragment from {addr}: {e}");
                        continue;
                    }
                }
            }

            return Ok(Some((packet, addr)));
        }
    }
}

/// Salt generator for the handshake challenge.
pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}
