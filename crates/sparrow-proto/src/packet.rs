use bytes::{Buf, BufMut, BytesMut};

use crate::{ProtocolError, CHUNK_SIZE, MAX_PAYLOAD_SIZE};

const KIND_ERROR: u8 = 0x00;
const KIND_HANDSHAKE1: u8 = 0x01;
const KIND_HANDSHAKE2: u8 = 0x02;
const KIND_HANDSHAKE3: u8 = 0x03;
const KIND_FILE_REQ: u8 = 0x04;
const KIND_FILE_DEL: u8 = 0x05;
const KIND_DATA_CHUNK: u8 = 0x06;
const KIND_ACK: u8 = 0x07;

const REQ_ALL: u8 = 0x00;
const REQ_RANGE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Handshake1,
    Handshake2,
    Handshake3,
    FileRequest,
    FileDelete,
    DataChunk,
    Ack,
    Error,
}

/// Pure function of the leading byte. Unrecognized input never fails,
/// it categorizes to `Error` so the receiver can branch safely.
pub fn categorize(frame: &[u8]) -> PacketKind {
    match frame.first() {
        Some(&KIND_HANDSHAKE1) => PacketKind::Handshake1,
        Some(&KIND_HANDSHAKE2) => PacketKind::Handshake2,
        Some(&KIND_HANDSHAKE3) => PacketKind::Handshake3,
        Some(&KIND_FILE_REQ) => PacketKind::FileRequest,
        Some(&KIND_FILE_DEL) => PacketKind::FileDelete,
        Some(&KIND_DATA_CHUNK) => PacketKind::DataChunk,
        Some(&KIND_ACK) => PacketKind::Ack,
        _ => PacketKind::Error,
    }
}

/// What portion of an artifact a ground station wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRequest {
    All,
    /// Byte range [start, end), used to resume a dropped transfer.
    Range { start: u32, end: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Session opener, payload is a telemetry blob.
    Handshake1 { telemetry: Vec<u8> },
    /// Ground reply; may carry a proposed config update (empty = none).
    Handshake2 { config: Vec<u8> },
    /// Announces how many artifacts are available for download.
    Handshake3 { artifact_count: u16 },
    FileRequest { artifact_id: u16, request: ChunkRequest },
    FileDelete { artifact_id: u16 },
    DataChunk { artifact_id: u16, seq: u16, data: Vec<u8> },
    Ack { seq: u16 },
    /// Catch-all for unrecognized frames; carries the raw bytes.
    Error { detail: Vec<u8> },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake1 { .. } => PacketKind::Handshake1,
            Packet::Handshake2 { .. } => PacketKind::Handshake2,
            Packet::Handshake3 { .. } => PacketKind::Handshake3,
            Packet::FileRequest { .. } => PacketKind::FileRequest,
            Packet::FileDelete { .. } => PacketKind::FileDelete,
            Packet::DataChunk { .. } => PacketKind::DataChunk,
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::Error { .. } => PacketKind::Error,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.check_bounds()?;
        let mut buf = BytesMut::with_capacity(1 + MAX_PAYLOAD_SIZE);
        match self {
            Packet::Handshake1 { telemetry } => {
                buf.put_u8(KIND_HANDSHAKE1);
                buf.put_slice(telemetry);
            }
            Packet::Handshake2 { config } => {
                buf.put_u8(KIND_HANDSHAKE2);
                buf.put_slice(config);
            }
            Packet::Handshake3 { artifact_count } => {
                buf.put_u8(KIND_HANDSHAKE3);
                buf.put_u16(*artifact_count);
            }
            Packet::FileRequest { artifact_id, request } => {
                buf.put_u8(KIND_FILE_REQ);
                buf.put_u16(*artifact_id);
                match request {
                    ChunkRequest::All => buf.put_u8(REQ_ALL),
                    ChunkRequest::Range { start, end } => {
                        buf.put_u8(REQ_RANGE);
                        buf.put_u32(*start);
                        buf.put_u32(*end);
                    }
                }
            }
            Packet::FileDelete { artifact_id } => {
                buf.put_u8(KIND_FILE_DEL);
                buf.put_u16(*artifact_id);
            }
            Packet::DataChunk { artifact_id, seq, data } => {
                buf.put_u8(KIND_DATA_CHUNK);
                buf.put_u16(*artifact_id);
                buf.put_u16(*seq);
                buf.put_slice(data);
            }
            Packet::Ack { seq } => {
                buf.put_u8(KIND_ACK);
                buf.put_u16(*seq);
            }
            Packet::Error { detail } => {
                buf.put_u8(KIND_ERROR);
                buf.put_slice(detail);
            }
        }
        Ok(buf.to_vec())
    }

    /// Total over arbitrary input: anything unrecognized decodes to
    /// `Packet::Error`. Only structurally short frames of a known kind
    /// report `Truncated`.
    pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError> {
        let kind = categorize(frame);
        let mut body = &frame[1.min(frame.len())..];
        match kind {
            PacketKind::Handshake1 => Ok(Packet::Handshake1 { telemetry: body.to_vec() }),
            PacketKind::Handshake2 => Ok(Packet::Handshake2 { config: body.to_vec() }),
            PacketKind::Handshake3 => {
                if body.remaining() < 2 {
                    return Err(ProtocolError::Truncated { kind });
                }
                Ok(Packet::Handshake3 { artifact_count: body.get_u16() })
            }
            PacketKind::FileRequest => {
                if body.remaining() < 3 {
                    return Err(ProtocolError::Truncated { kind });
                }
                let artifact_id = body.get_u16();
                let request = match body.get_u8() {
                    REQ_ALL => ChunkRequest::All,
                    REQ_RANGE => {
                        if body.remaining() < 8 {
                            return Err(ProtocolError::Truncated { kind });
                        }
                        ChunkRequest::Range { start: body.get_u32(), end: body.get_u32() }
                    }
                    _ => return Err(ProtocolError::Truncated { kind }),
                };
                Ok(Packet::FileRequest { artifact_id, request })
            }
            PacketKind::FileDelete => {
                if body.remaining() < 2 {
                    return Err(ProtocolError::Truncated { kind });
                }
                Ok(Packet::FileDelete { artifact_id: body.get_u16() })
            }
            PacketKind::DataChunk => {
                if body.remaining() < 4 {
                    return Err(ProtocolError::Truncated { kind });
                }
                let artifact_id = body.get_u16();
                let seq = body.get_u16();
                Ok(Packet::DataChunk { artifact_id, seq, data: body.to_vec() })
            }
            PacketKind::Ack => {
                if body.remaining() < 2 {
                    return Err(ProtocolError::Truncated { kind });
                }
                Ok(Packet::Ack { seq: body.get_u16() })
            }
            PacketKind::Error => {
                // A genuine Error packet sheds its kind byte like every
                // other kind; an unknown kind byte keeps the whole frame
                // so the receiver can log what actually arrived.
                if frame.first() == Some(&KIND_ERROR) {
                    Ok(Packet::Error { detail: body.to_vec() })
                } else {
                    Ok(Packet::Error { detail: frame.to_vec() })
                }
            }
        }
    }

    fn check_bounds(&self) -> Result<(), ProtocolError> {
        let len = match self {
            Packet::Handshake1 { telemetry } => telemetry.len(),
            Packet::Handshake2 { config } => config.len(),
            Packet::Error { detail } => detail.len(),
            Packet::DataChunk { data, .. } => {
                if data.len() > CHUNK_SIZE {
                    return Err(ProtocolError::OversizedPayload { len: data.len() + 2 });
                }
                return Ok(());
            }
            _ => return Ok(()),
        };
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPayload { len });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(p: Packet) {
        let wire = p.encode().expect("encode");
        assert_eq!(Packet::decode(&wire).expect("decode"), p);
    }

    #[test]
    fn roundtrip_all_kinds() {
        roundtrip(Packet::Handshake1 { telemetry: b"{\"vb\":7.1}".to_vec() });
        roundtrip(Packet::Handshake2 { config: vec![] });
        roundtrip(Packet::Handshake2 { config: b"{\"quality\":20}".to_vec() });
        roundtrip(Packet::Handshake3 { artifact_count: 17 });
        roundtrip(Packet::FileRequest { artifact_id: 3, request: ChunkRequest::All });
        roundtrip(Packet::FileRequest {
            artifact_id: 3,
            request: ChunkRequest::Range { start: 486, end: 1000 },
        });
        roundtrip(Packet::FileDelete { artifact_id: 9 });
        roundtrip(Packet::DataChunk { artifact_id: 3, seq: 4, data: vec![0xAB; 28] });
        roundtrip(Packet::DataChunk { artifact_id: 0, seq: 0, data: vec![0; CHUNK_SIZE] });
        roundtrip(Packet::Ack { seq: 4 });
        roundtrip(Packet::Error { detail: b"no such artifact".to_vec() });
        roundtrip(Packet::Error { detail: vec![] });
    }

    #[test]
    fn categorize_is_total() {
        assert_eq!(categorize(&[]), PacketKind::Error);
        assert_eq!(categorize(&[0xFF, 1, 2, 3]), PacketKind::Error);
        assert_eq!(categorize(&[0x42]), PacketKind::Error);
        assert_eq!(categorize(&[0x04, 0, 1, 0]), PacketKind::FileRequest);
    }

    #[test]
    fn garbage_decodes_to_error_packet() {
        let p = Packet::decode(&[0xFF, 0xDE, 0xAD]).expect("decode");
        assert_eq!(p.kind(), PacketKind::Error);
        match p {
            Packet::Error { detail } => assert_eq!(detail, vec![0xFF, 0xDE, 0xAD]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let p = Packet::Handshake1 { telemetry: vec![0; MAX_PAYLOAD_SIZE + 1] };
        assert_eq!(
            p.encode(),
            Err(ProtocolError::OversizedPayload { len: MAX_PAYLOAD_SIZE + 1 })
        );

        let p = Packet::DataChunk { artifact_id: 0, seq: 0, data: vec![0; CHUNK_SIZE + 1] };
        assert!(matches!(p.encode(), Err(ProtocolError::OversizedPayload { .. })));
    }

    #[test]
    fn truncated_frames_reported() {
        assert_eq!(
            Packet::decode(&[0x03]),
            Err(ProtocolError::Truncated { kind: PacketKind::Handshake3 })
        );
        assert_eq!(
            Packet::decode(&[0x06, 0, 1]),
            Err(ProtocolError::Truncated { kind: PacketKind::DataChunk })
        );
        assert_eq!(
            Packet::decode(&[0x04, 0, 1, 0x01, 0, 0]),
            Err(ProtocolError::Truncated { kind: PacketKind::FileRequest })
        );
    }
}
