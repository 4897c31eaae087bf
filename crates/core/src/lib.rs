pub mod event;
pub mod interp;
pub mod net;

pub use event::{DisconnectReason, EventQueue, ServerDescriptor, SessionEvent};
pub use interp::{
    EntityPose, EntityStateBuffer, InterpolatedState, InterpolationEngine, InterpolatorConfig,
};
pub use net::{
    ConnectionStage, EntityEntry, EntityFlags, MAX_PACKET_SIZE, NetError, NetResult, NetworkStats,
    PROTOCOL_VERSION, Packet, PacketError, PacketHeader, PacketKind, PacketPayload,
    RawEntityState, SessionConfig, SessionManager, SessionTask, kind,
};
