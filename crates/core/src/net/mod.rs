mod error;
mod listener;
mod protocol;
mod session;
mod socket;

pub use error::{NetError, NetResult};
pub use listener::{ListenerRegistry, PacketCallback};
pub use protocol::{
    EntityEntry, EntityFlags, INTERNAL_KIND_LIMIT, MAX_PACKET_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, Packet, PacketError, PacketHeader, PacketKind, PacketPayload,
    RawEntityState, Reassembler, encode_frames, is_internal_kind, kind,
};
pub use session::{ConnectionStage, SessionConfig, SessionManager, SessionTask};
pub use socket::{LinkMetrics, NetworkStats, RECV_POLL, TransportSocket, rand_u64};
