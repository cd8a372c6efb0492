pub mod doctor;
pub mod settings;
pub mod storage;

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use sparrow_link::{LinkError, PacketLink, Radio};
use sparrow_proto::{ChunkRequest, Packet, PacketKind, CHUNK_SIZE};

use crate::settings::apply_settings_update;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Bytes of file data per chunk; never larger than the packet
    /// payload allows (CHUNK_SIZE).
    pub chunk_size: usize,
    pub handshake_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Quiet time in Listening before the session is considered over.
    pub listen_timeout_ms: u64,
    /// Retransmit budget per chunk, on top of the first attempt.
    pub max_chunk_retries: u32,
    pub artifact_dir: String,
    pub settings_path: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            handshake_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            listen_timeout_ms: 10_000,
            max_chunk_retries: 3,
            artifact_dir: "artifacts".into(),
            settings_path: "config/camera.json".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AwaitingHandshake2,
    AwaitingHandshake3Ack,
    Listening,
    Sending,
}

#[derive(Debug)]
pub enum AbortReason {
    RetriesExhausted { seq: u16 },
    Unexpected(PacketKind),
    Link(LinkError),
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// Nobody answered the opening handshake; the scheduler simply
    /// tries again on a later tick.
    NoContact,
    Completed { requests_served: u32 },
    Aborted(AbortReason),
}

enum ServeError {
    MissingArtifact,
    Abort(AbortReason),
}

/// Drives one ground-contact session: telemetry handshake, optional
/// config uplink, then serving file requests chunk by chunk. At most
/// one session exists at a time; the protocol owns no radio and is
/// handed the link only for the duration of `run_session`.
pub struct TransferProtocol {
    cfg: TransferConfig,
    state: TransferState,
}

impl TransferProtocol {
    pub fn new(cfg: TransferConfig) -> Self {
        Self { cfg, state: TransferState::Idle }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn artifact_path(&self, artifact_id: u16) -> String {
        format!("{}/art_{:05}.bin", self.cfg.artifact_dir, artifact_id)
    }

    pub fn run_session<R: Radio>(
        &mut self,
        link: &mut PacketLink<R>,
        storage: &mut dyn Storage,
        telemetry: Vec<u8>,
    ) -> SessionOutcome {
        let outcome = self.drive(link, storage, telemetry);
        // Whatever happened, the session is over.
        self.state = TransferState::Idle;
        match &outcome {
            SessionOutcome::NoContact => debug!("transfer: no contact"),
            SessionOutcome::Completed { requests_served } => {
                info!("transfer: session complete, {} request(s) served", requests_served)
            }
            SessionOutcome::Aborted(reason) => warn!("transfer: session aborted: {:?}", reason),
        }
        outcome
    }

    fn drive<R: Radio>(
        &mut self,
        link: &mut PacketLink<R>,
        storage: &mut dyn Storage,
        telemetry: Vec<u8>,
    ) -> SessionOutcome {
        let hs_timeout = Duration::from_millis(self.cfg.handshake_timeout_ms);
        let ack_timeout = Duration::from_millis(self.cfg.ack_timeout_ms);
        let listen_timeout = Duration::from_millis(self.cfg.listen_timeout_ms);

        // Handshake 1: telemetry ping.
        self.state = TransferState::AwaitingHandshake2;
        if let Err(e) = link.send_packet(&Packet::Handshake1 { telemetry }) {
            return SessionOutcome::Aborted(AbortReason::Link(e));
        }

        let reply = match link.receive_packet(hs_timeout) {
            Ok(Some(p)) => p,
            Ok(None) => return SessionOutcome::NoContact,
            Err(e) => return SessionOutcome::Aborted(AbortReason::Link(e)),
        };
        match reply {
            Packet::Handshake2 { config } => {
                if !config.is_empty() {
                    if let Err(e) =
                        apply_settings_update(storage, &self.cfg.settings_path, &config)
                    {
                        // Rejected update is reported, prior settings
                        // stay in effect, the session carries on.
                        warn!("transfer: config update rejected: {}", e);
                    }
                }
            }
            other => return SessionOutcome::Aborted(AbortReason::Unexpected(other.kind())),
        }

        // Handshake 3: advertise artifact inventory, wait for the ack.
        let artifact_count = match storage.list(&self.cfg.artifact_dir) {
            Ok(files) => files.len() as u16,
            Err(e) => {
                warn!("transfer: artifact listing failed: {}", e);
                0
            }
        };
        self.state = TransferState::AwaitingHandshake3Ack;
        if let Err(e) = link.send_packet(&Packet::Handshake3 { artifact_count }) {
            return SessionOutcome::Aborted(AbortReason::Link(e));
        }
        match link.receive_packet(ack_timeout) {
            Ok(Some(Packet::Ack { .. })) => {}
            Ok(None) => return SessionOutcome::NoContact,
            Ok(Some(other)) => {
                return SessionOutcome::Aborted(AbortReason::Unexpected(other.kind()))
            }
            Err(e) => return SessionOutcome::Aborted(AbortReason::Link(e)),
        }

        // Listening: serve requests until silence or an unrelated packet.
        self.state = TransferState::Listening;
        let mut requests_served = 0u32;
        loop {
            match link.receive_packet(listen_timeout) {
                Ok(None) => return SessionOutcome::Completed { requests_served },
                Err(e) => return SessionOutcome::Aborted(AbortReason::Link(e)),
                Ok(Some(Packet::FileRequest { artifact_id, request })) => {
                    match self.serve_request(link, storage, artifact_id, request) {
                        Ok(()) => requests_served += 1,
                        Err(ServeError::MissingArtifact) => {
                            let reply = Packet::Error { detail: b"no such artifact".to_vec() };
                            if let Err(e) = link.send_packet(&reply) {
                                return SessionOutcome::Aborted(AbortReason::Link(e));
                            }
                        }
                        Err(ServeError::Abort(reason)) => {
                            return SessionOutcome::Aborted(reason)
                        }
                    }
                }
                Ok(Some(Packet::FileDelete { artifact_id })) => {
                    let path = self.artifact_path(artifact_id);
                    match storage.delete(&path) {
                        Ok(()) => info!("transfer: deleted {}", path),
                        // Idempotent: deleting what is already gone succeeds.
                        Err(StorageError::Missing(_)) => debug!("transfer: {} already gone", path),
                        Err(e) => warn!("transfer: delete {} failed: {}", path, e),
                    }
                    requests_served += 1;
                }
                Ok(Some(other)) => {
                    debug!("transfer: session closed by {:?}", other.kind());
                    return SessionOutcome::Completed { requests_served };
                }
            }
        }
    }

    fn serve_request<R: Radio>(
        &mut self,
        link: &mut PacketLink<R>,
        storage: &mut dyn Storage,
        artifact_id: u16,
        request: ChunkRequest,
    ) -> Result<(), ServeError> {
        let path = self.artifact_path(artifact_id);
        let data = match storage.read(&path) {
            Ok(d) => d,
            Err(StorageError::Missing(_)) => {
                warn!("transfer: requested artifact {} not on storage", artifact_id);
                return Err(ServeError::MissingArtifact);
            }
            Err(e) => {
                warn!("transfer: read {} failed: {}", path, e);
                return Err(ServeError::MissingArtifact);
            }
        };

        let (start, end) = match request {
            ChunkRequest::All => (0usize, data.len()),
            ChunkRequest::Range { start, end } => {
                // Align the start down to a chunk boundary so a resume
                // carries the same seq numbers as the original pass even
                // when the ground asks from mid-chunk.
                let start = start as usize - (start as usize % self.cfg.chunk_size);
                (start, (end as usize).min(data.len()))
            }
        };
        if start >= end {
            debug!("transfer: empty range for artifact {}", artifact_id);
            return Ok(());
        }

        info!(
            "transfer: sending artifact {} bytes {}..{} in {}-byte chunks",
            artifact_id, start, end, self.cfg.chunk_size
        );
        self.state = TransferState::Sending;
        let mut offset = start;
        while offset < end {
            let len = self.cfg.chunk_size.min(end - offset);
            // Sequence numbers are file positions, not send order, so a
            // resumed range carries the same seq as the original pass.
            // Artifacts are camera images, orders of magnitude below the
            // chunk_size * u16::MAX point where this cast could wrap.
            let seq = (offset / self.cfg.chunk_size) as u16;
            self.send_chunk(link, artifact_id, seq, data[offset..offset + len].to_vec())?;
            offset += len;
        }
        self.state = TransferState::Listening;
        Ok(())
    }

    /// Stop-and-wait: one chunk outstanding, retransmitted until acked
    /// or the retry budget runs out. Acked chunks are never re-sent.
    fn send_chunk<R: Radio>(
        &mut self,
        link: &mut PacketLink<R>,
        artifact_id: u16,
        seq: u16,
        data: Vec<u8>,
    ) -> Result<(), ServeError> {
        let ack_timeout = Duration::from_millis(self.cfg.ack_timeout_ms);
        let packet = Packet::DataChunk { artifact_id, seq, data };

        for attempt in 0..=self.cfg.max_chunk_retries {
            if let Err(e) = link.send_packet(&packet) {
                return Err(ServeError::Abort(AbortReason::Link(e)));
            }
            match link.receive_packet(ack_timeout) {
                Ok(Some(Packet::Ack { seq: acked })) if acked == seq => return Ok(()),
                Ok(Some(p)) => {
                    warn!(
                        "transfer: chunk {} attempt {}: expected ack, got {:?}",
                        seq,
                        attempt + 1,
                        p.kind()
                    );
                }
                Ok(None) => {
                    warn!("transfer: chunk {} attempt {}: ack timeout", seq, attempt + 1);
                }
                Err(e) => {
                    warn!("transfer: chunk {} attempt {}: {}", seq, attempt + 1, e);
                }
            }
        }
        Err(ServeError::Abort(AbortReason::RetriesExhausted { seq }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use sparrow_link::testing::ScriptedRadio;

    fn enc(p: Packet) -> Vec<u8> {
        p.encode().unwrap()
    }

    fn proto() -> TransferProtocol {
        TransferProtocol::new(TransferConfig {
            artifact_dir: "images".into(),
            ..TransferConfig::default()
        })
    }

    fn storage_with(id: u16, len: usize) -> MemStorage {
        let mut s = MemStorage::new();
        let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        s.write(&format!("images/art_{:05}.bin", id), &body).unwrap();
        s
    }

    fn chunks_of(sent: &[Vec<u8>]) -> Vec<(u16, usize)> {
        sent.iter()
            .filter_map(|f| match Packet::decode(f).unwrap() {
                Packet::DataChunk { seq, data, .. } => Some((seq, data.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn full_file_goes_out_in_five_acked_chunks() {
        let mut tp = proto();
        let mut storage = storage_with(3, 1000);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::FileRequest { artifact_id: 3, request: ChunkRequest::All }));
        for seq in 0..5 {
            radio.push_inbound(enc(Packet::Ack { seq }));
        }
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 1 }));
        assert_eq!(tp.state(), TransferState::Idle);

        let sent = link.radio_mut().outbound();
        // 1000 bytes at 243 per chunk: 4 full chunks and a 28-byte tail.
        assert_eq!(chunks_of(&sent), vec![(0, 243), (1, 243), (2, 243), (3, 243), (4, 28)]);
        // Handshake1, Handshake3, then the chunks and nothing else.
        assert_eq!(sent.len(), 7);
    }

    #[test]
    fn silent_ground_resets_to_idle_without_panicking() {
        let mut tp = proto();
        let mut storage = storage_with(0, 100);
        let mut link = PacketLink::new(ScriptedRadio::new());

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::NoContact));
        assert_eq!(tp.state(), TransferState::Idle);
        assert_eq!(link.radio_mut().sent_count(), 1); // just Handshake1
    }

    #[test]
    fn range_request_resumes_mid_file() {
        let mut tp = proto();
        let mut storage = storage_with(3, 1000);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::FileRequest {
            artifact_id: 3,
            request: ChunkRequest::Range { start: 486, end: 1000 },
        }));
        for seq in 2..5 {
            radio.push_inbound(enc(Packet::Ack { seq }));
        }
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 1 }));

        // Only the tail is re-sent, with file-position sequence numbers.
        let sent = link.radio_mut().outbound();
        assert_eq!(chunks_of(&sent), vec![(2, 243), (3, 243), (4, 28)]);
    }

    #[test]
    fn unaligned_range_start_snaps_to_a_chunk_boundary() {
        let mut tp = proto();
        let mut storage = storage_with(3, 1000);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        // 500 sits inside chunk 2 (486..729); the resume must restart it.
        radio.push_inbound(enc(Packet::FileRequest {
            artifact_id: 3,
            request: ChunkRequest::Range { start: 500, end: 1000 },
        }));
        for seq in 2..5 {
            radio.push_inbound(enc(Packet::Ack { seq }));
        }
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 1 }));
        assert_eq!(chunks_of(&link.radio_mut().outbound()), vec![(2, 243), (3, 243), (4, 28)]);
    }

    #[test]
    fn lost_ack_redrives_only_the_outstanding_chunk() {
        let mut tp = proto();
        let mut storage = storage_with(1, 300); // chunks: (0,243) (1,57)

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::FileRequest { artifact_id: 1, request: ChunkRequest::All }));
        radio.push_inbound(enc(Packet::Ack { seq: 9 })); // stray ack for chunk 0
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::Ack { seq: 1 }));
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 1 }));

        let sent = link.radio_mut().outbound();
        // Chunk 0 twice (stray ack forced one retransmit), chunk 1 once.
        assert_eq!(chunks_of(&sent), vec![(0, 243), (0, 243), (1, 57)]);
    }

    #[test]
    fn retry_budget_exhaustion_aborts_session() {
        let mut tp = proto();
        let mut storage = storage_with(1, 10);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::FileRequest { artifact_id: 1, request: ChunkRequest::All }));
        // No acks ever arrive for the chunk.
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted(AbortReason::RetriesExhausted { seq: 0 })
        ));
        assert_eq!(tp.state(), TransferState::Idle);

        // First attempt plus the full retry budget.
        let sent = link.radio_mut().outbound();
        assert_eq!(chunks_of(&sent).len(), 4);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut tp = proto();
        let mut storage = storage_with(5, 64);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::FileDelete { artifact_id: 5 }));
        radio.push_inbound(enc(Packet::FileDelete { artifact_id: 5 })); // already gone
        radio.push_inbound(enc(Packet::FileDelete { artifact_id: 44 })); // never existed
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 3 }));
        assert!(!storage.contains("images/art_00005.bin"));
    }

    #[test]
    fn unrelated_packet_ends_listening() {
        let mut tp = proto();
        let mut storage = storage_with(1, 300);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::Handshake1 { telemetry: vec![] }));
        radio.push_inbound(enc(Packet::FileRequest { artifact_id: 1, request: ChunkRequest::All }));
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        // Session ended before the (now stale) request was read.
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 0 }));
        assert_eq!(chunks_of(&link.radio_mut().outbound()), vec![]);
    }

    #[test]
    fn missing_artifact_reports_and_keeps_listening() {
        let mut tp = proto();
        let mut storage = storage_with(1, 50);

        let mut radio = ScriptedRadio::new();
        radio.push_inbound(enc(Packet::Handshake2 { config: vec![] }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        radio.push_inbound(enc(Packet::FileRequest { artifact_id: 99, request: ChunkRequest::All }));
        radio.push_inbound(enc(Packet::FileRequest { artifact_id: 1, request: ChunkRequest::All }));
        radio.push_inbound(enc(Packet::Ack { seq: 0 }));
        let mut link = PacketLink::new(radio);

        let outcome = tp.run_session(&mut link, &mut storage, b"{}".to_vec());
        assert!(matches!(outcome, SessionOutcome::Completed { requests_served: 1 }));

        let sent = link.radio_mut().outbound();
        let kinds: Vec<PacketKind> =
            sent.iter().map(|f| sparrow_proto::categorize(f)).collect();
        assert!(kinds.contains(&PacketKind::Error));
        assert_eq!(chunks_of(&sent), vec![(0, 50)]);
    }
}
