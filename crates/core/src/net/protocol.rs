use std::collections::HashMap;
use std::time::{Duration, Instant};

use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_MAGIC: u32 = 0x54455448;
pub const PROTOCOL_VERSION: u8 = 1;

/// Packet kinds below this value are transport-internal and handled by
/// builtin listeners before any user code sees them.
pub const INTERNAL_KIND_LIMIT: PacketKind = 100;

const FRAGMENT_CHUNK: usize = 1024;
const REASSEMBLY_EXPIRY: Duration = Duration::from_secs(5);
const MAX_PARTIAL_MESSAGES: usize = 64;

pub type PacketKind = u16;

/// Stable numeric identifiers for every packet kind on the wire.
pub mod kind {
    use super::PacketKind;

    pub const HANDSHAKE_START: PacketKind = 1;
    pub const HANDSHAKE_CHALLENGE: PacketKind = 2;
    pub const HANDSHAKE_RESPONSE: PacketKind = 3;
    pub const HANDSHAKE_ACCEPTED: PacketKind = 4;
    pub const HANDSHAKE_DENIED: PacketKind = 5;
    pub const LOGIN: PacketKind = 6;
    pub const LOGIN_ACCEPTED: PacketKind = 7;
    pub const LOGIN_DENIED: PacketKind = 8;
    pub const KEEPALIVE: PacketKind = 9;
    pub const KEEPALIVE_ACK: PacketKind = 10;
    pub const SERVER_PING: PacketKind = 11;
    pub const SERVER_PONG: PacketKind = 12;
    pub const DISCONNECT: PacketKind = 13;
    pub const FRAGMENT: PacketKind = 14;

    pub const ENTITY_UPDATE: PacketKind = 100;
    pub const CHAT_MESSAGE: PacketKind = 101;
}

pub fn is_internal_kind(kind: PacketKind) -> bool {
    kind < INTERNAL_KIND_LIMIT
}

bitflags::bitflags! {
    /// Discrete visual state bits carried with every raw entity sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntityFlags: u16 {
        const JUMP_HELD = 1 << 0;
        const SECONDARY_HELD = 1 << 1;
        const FACING_LEFT = 1 << 2;
        const DASHING = 1 << 3;
        const GROUNDED = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    pub kind: PacketKind,
}

impl PacketHeader {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            kind,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, Copy, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct RawEntityState {
    pub position: [f32; 2],
    pub rotation: f32,
    pub flags: u16,
}

impl RawEntityState {
    pub fn new(position: [f32; 2], rotation: f32, flags: EntityFlags) -> Self {
        Self {
            position,
            rotation,
            flags: flags.bits(),
        }
    }

    pub fn decode_flags(&self) -> EntityFlags {
        EntityFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: EntityFlags) {
        self.flags = flags.bits();
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityEntry {
    pub entity_id: u32,
    pub state: RawEntityState,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketPayload {
    HandshakeStart {
        client_salt: u64,
    },
    HandshakeChallenge {
        server_salt: u64,
        challenge: u64,
    },
    HandshakeResponse {
        proof: u64,
    },
    HandshakeAccepted {
        session_id: u32,
    },
    HandshakeDenied {
        reason: String,
        server_version: u8,
    },
    Login {
        account_id: u32,
        token: String,
    },
    LoginAccepted,
    LoginDenied {
        reason: String,
    },
    Keepalive {
        timestamp: u64,
    },
    KeepaliveAck {
        timestamp: u64,
    },
    ServerPing {
        ping_id: u32,
    },
    ServerPong {
        ping_id: u32,
        player_count: u32,
    },
    Disconnect,
    Fragment {
        message_id: u32,
        index: u16,
        total: u16,
        data: Vec<u8>,
    },
    EntityUpdate {
        server_time: f32,
        entities: Vec<EntityEntry>,
    },
    ChatMessage {
        sender_id: u32,
        message: String,
    },
}

impl PacketPayload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::HandshakeStart { .. } => kind::HANDSHAKE_START,
            Self::HandshakeChallenge { .. } => kind::HANDSHAKE_CHALLENGE,
            Self::HandshakeResponse { .. } => kind::HANDSHAKE_RESPONSE,
            Self::HandshakeAccepted { .. } => kind::HANDSHAKE_ACCEPTED,
            Self::HandshakeDenied { .. } => kind::HANDSHAKE_DENIED,
            Self::Login { .. } => kind::LOGIN,
            Self::LoginAccepted => kind::LOGIN_ACCEPTED,
            Self::LoginDenied { .. } => kind::LOGIN_DENIED,
            Self::Keepalive { .. } => kind::KEEPALIVE,
            Self::KeepaliveAck { .. } => kind::KEEPALIVE_ACK,
            Self::ServerPing { .. } => kind::SERVER_PING,
            Self::ServerPong { .. } => kind::SERVER_PONG,
            Self::Disconnect => kind::DISCONNECT,
            Self::Fragment { .. } => kind::FRAGMENT,
            Self::EntityUpdate { .. } => kind::ENTITY_UPDATE,
            Self::ChatMessage { .. } => kind::CHAT_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("invalid fragment: {0}")]
    InvalidFragment(&'static str),
}

impl Packet {
    pub fn new(payload: PacketPayload) -> Self {
        Self {
            header: PacketHeader::new(payload.kind()),
            payload,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.header.is_valid() && self.header.kind == self.payload.kind()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // rkyv's archived layout needs an aligned backing buffer. Datagrams
        // land in arbitrary `[u8; N]` receive buffers whose alignment is not
        // guaranteed, so copy into an aligned buffer before decoding.
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

/// Splits an encoded packet into wire frames. Packets that fit in a single
/// datagram come back as one frame; oversized ones are cut into `Fragment`
/// packets that reassemble on the far side.
pub fn encode_frames(packet: &Packet, next_message_id: &mut u32) -> Result<Vec<Vec<u8>>, PacketError> {
    let data = packet.serialize()?;
    if data.len() <= MAX_PACKET_SIZE {
        return Ok(vec![data]);
    }

    let message_id = *next_message_id;
    *next_message_id = next_message_id.wrapping_add(1);

    let total = data.len().div_ceil(FRAGMENT_CHUNK);
    if total > u16::MAX as usize {
        return Err(PacketError::InvalidFragment("payload too large to fragment"));
    }

    let mut frames = Vec::with_capacity(total);
    for (index, chunk) in data.chunks(FRAGMENT_CHUNK).enumerate() {
        let fragment = Packet::new(PacketPayload::Fragment {
            message_id,
            index: index as u16,
            total: total as u16,
            data: chunk.to_vec(),
        });
        frames.push(fragment.serialize()?);
    }
    Ok(frames)
}

#[derive(Debug)]
struct PartialMessage {
    total: u16,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    started: Instant,
}

/// Collects `Fragment` packets until a full message can be decoded.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u32, PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment; returns the reassembled packet once every chunk
    /// for its message has arrived.
    pub fn insert(
        &mut self,
        message_id: u32,
        index: u16,
        total: u16,
        data: Vec<u8>,
    ) -> Result<Option<Packet>, PacketError> {
        if total == 0 || index >= total {
            return Err(PacketError::InvalidFragment("index out of range"));
        }

        self.evict_expired();

        match self.partial.get(&message_id) {
            Some(existing) if existing.total != total => {
                self.partial.remove(&message_id);
                return Err(PacketError::InvalidFragment("fragment count mismatch"));
            }
            Some(_) => {}
            None => {
                if self.partial.len() >= MAX_PARTIAL_MESSAGES {
                    return Err(PacketError::InvalidFragment("too many partial messages"));
                }
                self.partial.insert(
                    message_id,
                    PartialMessage {
                        total,
                        chunks: (0..total).map(|_| None).collect(),
                        received: 0,
                        started: Instant::now(),
                    },
                );
            }
        }

        let entry = self.partial.get_mut(&message_id).unwrap();
        let slot = &mut entry.chunks[index as usize];
        if slot.is_none() {
            *slot = Some(data);
            entry.received += 1;
        }

        if entry.received < entry.total as usize {
            return Ok(None);
        }

        let entry = self.partial.remove(&message_id).unwrap();
        let mut data = Vec::with_capacity(entry.total as usize * FRAGMENT_CHUNK);
        for chunk in entry.chunks {
            data.extend_from_slice(&chunk.unwrap());
        }
        Packet::deserialize(&data).map(Some)
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }

    fn evict_expired(&mut self) {
        self.partial
            .retain(|_, partial| partial.started.elapsed() < REASSEMBLY_EXPIRY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_stability() {
        assert_eq!(
            Packet::new(PacketPayload::HandshakeStart { client_salt: 1 })
                .header
                .kind,
            kind::HANDSHAKE_START
        );
        assert_eq!(
            Packet::new(PacketPayload::EntityUpdate {
                server_time: 0.0,
                entities: Vec::new(),
            })
            .header
            .kind,
            kind::ENTITY_UPDATE
        );
        assert!(is_internal_kind(kind::FRAGMENT));
        assert!(!is_internal_kind(kind::ENTITY_UPDATE));
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet::new(PacketPayload::Keepalive { timestamp: 12345 });

        let serialized = packet.serialize().unwrap();
        assert!(serialized.len() <= MAX_PACKET_SIZE);

        let deserialized = Packet::deserialize(&serialized).unwrap();
        assert!(deserialized.is_valid());
        assert_eq!(packet.header, deserialized.header);
    }

    #[test]
    fn test_kind_mismatch_is_invalid() {
        let mut packet = Packet::new(PacketPayload::Disconnect);
        packet.header.kind = kind::KEEPALIVE;
        assert!(!packet.is_valid());
    }

    #[test]
    fn test_fragmentation_round_trip() {
        let packet = Packet::new(PacketPayload::ChatMessage {
            sender_id: 7,
            message: "x".repeat(4000),
        });

        let mut next_id = 0;
        let frames = encode_frames(&packet, &mut next_id).unwrap();
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|f| f.len() <= MAX_PACKET_SIZE));

        let mut reassembler = Reassembler::new();
        let mut result = None;
        // deliver out of order
        for frame in frames.iter().rev() {
            let fragment = Packet::deserialize(frame).unwrap();
            match fragment.payload {
                PacketPayload::Fragment {
                    message_id,
                    index,
                    total,
                    data,
                } => {
                    if let Some(packet) =
                        reassembler.insert(message_id, index, total, data).unwrap()
                    {
                        result = Some(packet);
                    }
                }
                _ => panic!("Expected Fragment"),
            }
        }

        match result.expect("message not reassembled").payload {
            PacketPayload::ChatMessage { sender_id, message } => {
                assert_eq!(sender_id, 7);
                assert_eq!(message.len(), 4000);
            }
            _ => panic!("Expected ChatMessage"),
        }
    }

    #[test]
    fn test_entity_flags_round_trip() {
        let mut state = RawEntityState::new([1.0, 2.0], 0.5, EntityFlags::JUMP_HELD);
        state.set_flags(EntityFlags::JUMP_HELD | EntityFlags::FACING_LEFT);

        let flags = state.decode_flags();
        assert!(flags.contains(EntityFlags::JUMP_HELD));
        assert!(flags.contains(EntityFlags::FACING_LEFT));
        assert!(!flags.contains(EntityFlags::DASHING));
    }
}
