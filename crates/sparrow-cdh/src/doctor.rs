use anyhow::Result;

use crate::DispatcherConfig;

pub fn check_dispatcher(cfg: &DispatcherConfig) -> Result<()> {
    anyhow::ensure!(cfg.auth_code != [0u8; 4], "cdh.auth_code is all zeros");
    anyhow::ensure!(cfg.shutdown_token != [0u8; 4], "cdh.shutdown_token is all zeros");
    anyhow::ensure!(
        cfg.shutdown_token != cfg.auth_code,
        "cdh.shutdown_token must differ from cdh.auth_code (independent second factor)"
    );
    anyhow::ensure!(cfg.max_chain <= 8, "cdh.max_chain implausibly large");
    anyhow::ensure!(cfg.multi_msg_timeout_ms >= 100, "cdh.multi_msg_timeout_ms too short");
    Ok(())
}
