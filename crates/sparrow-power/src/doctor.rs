use anyhow::Result;

use crate::PowerConfig;

pub fn check_thresholds(cfg: &PowerConfig) -> Result<()> {
    anyhow::ensure!(cfg.critical_v < cfg.normal_v, "power.critical_v must be below power.normal_v");
    anyhow::ensure!(cfg.critical_v > 5.0, "power.critical_v implausibly low for a 2S pack");
    anyhow::ensure!(cfg.normal_v < 9.0, "power.normal_v implausibly high for a 2S pack");
    anyhow::ensure!(
        cfg.max_exit_margin_v > 0.0 && cfg.max_exit_margin_v < cfg.max_enter_margin_v,
        "power.max_exit_margin_v must sit inside (0, max_enter_margin_v) to form a hysteresis band"
    );
    Ok(())
}
