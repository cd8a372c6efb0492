use anyhow::Result;

use sparrow_proto::CHUNK_SIZE;

use crate::TransferConfig;

pub fn check_transfer(cfg: &TransferConfig) -> Result<()> {
    anyhow::ensure!(cfg.chunk_size > 0, "transfer.chunk_size must be nonzero");
    anyhow::ensure!(
        cfg.chunk_size <= CHUNK_SIZE,
        "transfer.chunk_size exceeds radio payload budget ({})",
        CHUNK_SIZE
    );
    anyhow::ensure!(cfg.max_chunk_retries >= 1, "transfer.max_chunk_retries must be >= 1");
    anyhow::ensure!(cfg.handshake_timeout_ms >= 1000, "transfer.handshake_timeout_ms too short");
    anyhow::ensure!(cfg.ack_timeout_ms >= 200, "transfer.ack_timeout_ms too short");
    anyhow::ensure!(!cfg.artifact_dir.is_empty(), "transfer.artifact_dir missing");
    anyhow::ensure!(!cfg.settings_path.is_empty(), "transfer.settings_path missing");
    Ok(())
}
