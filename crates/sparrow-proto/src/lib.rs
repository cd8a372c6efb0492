pub mod packet;
pub mod telemetry;

pub use packet::{categorize, ChunkRequest, Packet, PacketKind};

use thiserror::Error;

/// Radio chip buffer is 256 bytes; 4 bytes link header, 6 bytes packet
/// header, and max-length frames lose one more byte to a chip errata.
pub const MAX_PAYLOAD_SIZE: usize = 245;

/// Chunk payload leaves room for the 2-byte sequence number inside the
/// packet payload.
pub const CHUNK_SIZE: usize = 243;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload of {len} bytes exceeds MAX_PAYLOAD_SIZE ({MAX_PAYLOAD_SIZE})")]
    OversizedPayload { len: usize },

    #[error("frame truncated while decoding {kind:?}")]
    Truncated { kind: PacketKind },

    #[error("config schema mismatch: expected keys {expected}, got {got}")]
    SchemaMismatch { expected: String, got: String },

    #[error("unexpected packet kind {got:?}")]
    UnexpectedKind { got: PacketKind },
}
