use std::io;

use super::protocol::PacketError;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("address resolution failed for {addr}")]
    AddressResolution { addr: String },
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("protocol version mismatch: ours {ours}, server {theirs}")]
    ProtocolMismatch { ours: u8, theirs: u8 },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("not connected to a server")]
    NotConnected,
    #[error("peer stopped responding")]
    DeadPeerTimeout,
    #[error(transparent)]
    Codec(#[from] PacketError),
}
