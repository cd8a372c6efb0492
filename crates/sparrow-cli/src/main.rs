mod sim;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sparrow_cdh::{Dispatcher, DispatcherConfig};
use sparrow_link::PacketLink;
use sparrow_power::{PowerConfig, PowerManager};
use sparrow_sched::tasks::{
    BeaconTask, DetumbleTask, FaceCollectTask, FaceLogTask, HeaterTask, ImuDownlinkTask,
    ListenTask, TelemetryTask, TransferTask,
};
use sparrow_sched::{
    CubesatState, HardwareFlags, Platform, SchedConfig, Scheduler, TickOutcome,
};
use sparrow_transfer::storage::{FsStorage, Storage};
use sparrow_transfer::TransferConfig;

use crate::sim::{
    HostPlatform, SimActuators, SimBattery, SimConfig, SimFaces, SimImu, SimRadio,
};

#[derive(Debug, Parser)]
#[command(name = "sparrow", version, about = "SPARROWsat - cubesat flight control core")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Preflight configuration checks.
    Doctor,
    /// Run the flight loop.
    Run {
        /// Use the bench satellite (simulated radio and sensors).
        #[arg(long)]
        sim: bool,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    satellite: SatelliteCfg,
    power: PowerConfig,
    transfer: TransferConfig,
    sched: SchedConfig,
    cdh: CdhCfg,
    tasks: TasksCfg,
    sim: SimConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct SatelliteCfg {
    callsign: String,
    storage_root: String,
}

impl Default for SatelliteCfg {
    fn default() -> Self {
        Self { callsign: "KN6NAQ".into(), storage_root: "data".into() }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct CdhCfg {
    /// 4 bytes, hex-encoded.
    auth_code: String,
    shutdown_token: String,
    multi_msg_timeout_ms: u64,
    max_chain: u8,
    dangerous_min_interval_s: u64,
}

impl Default for CdhCfg {
    fn default() -> Self {
        // Bench codes only; flight configs override both.
        Self {
            auth_code: "594e453f".into(),
            shutdown_token: "0bfd49ec".into(),
            multi_msg_timeout_ms: 500,
            max_chain: 2,
            dangerous_min_interval_s: 60,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct TasksCfg {
    beacon_period_s: u64,
    telemetry_period_s: u64,
    listen_period_s: u64,
    listen_window_ms: u64,
    transfer_period_s: u64,
    face_collect_period_s: u64,
    face_log_period_s: u64,
    face_log_path: String,
    face_log_max_kib: u64,
    imu_period_s: u64,
    detumble_period_s: u64,
    detumble_pulse_s: u64,
    detumble_margin_dps: f32,
    heater_period_s: u64,
    heater_cycle_s: u64,
}

impl Default for TasksCfg {
    fn default() -> Self {
        Self {
            beacon_period_s: 30,
            telemetry_period_s: 60,
            listen_period_s: 10,
            listen_window_ms: 1_000,
            transfer_period_s: 200,
            face_collect_period_s: 60,
            face_log_period_s: 45,
            face_log_path: "logs/faces.jsonl".into(),
            face_log_max_kib: 64,
            imu_period_s: 100,
            detumble_period_s: 300,
            detumble_pulse_s: 7,
            detumble_margin_dps: 0.2,
            heater_period_s: 300,
            heater_cycle_s: 30,
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

fn parse_code(s: &str, what: &str) -> Result<[u8; 4]> {
    let raw = hex::decode(s).with_context(|| format!("{} is not valid hex", what))?;
    raw.as_slice()
        .try_into()
        .ok()
        .with_context(|| format!("{} must be exactly 4 bytes", what))
}

fn dispatcher_config(cdh: &CdhCfg) -> Result<DispatcherConfig> {
    Ok(DispatcherConfig {
        auth_code: parse_code(&cdh.auth_code, "cdh.auth_code")?,
        shutdown_token: parse_code(&cdh.shutdown_token, "cdh.shutdown_token")?,
        multi_msg_timeout_ms: cdh.multi_msg_timeout_ms,
        max_chain: cdh.max_chain,
        dangerous_min_interval_s: cdh.dangerous_min_interval_s,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run { sim } => run(&cfg, sim),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    sparrow_power::doctor::check_thresholds(&cfg.power)?;
    sparrow_transfer::doctor::check_transfer(&cfg.transfer)?;
    let dcfg = dispatcher_config(&cfg.cdh)?;
    sparrow_cdh::doctor::check_dispatcher(&dcfg)?;

    anyhow::ensure!(cfg.sched.tick_interval_ms > 0, "sched.tick_interval_ms must be nonzero");
    anyhow::ensure!(!cfg.satellite.callsign.is_empty(), "satellite.callsign missing");
    anyhow::ensure!(!cfg.satellite.storage_root.is_empty(), "satellite.storage_root missing");
    let t = &cfg.tasks;
    for (name, period) in [
        ("tasks.beacon_period_s", t.beacon_period_s),
        ("tasks.telemetry_period_s", t.telemetry_period_s),
        ("tasks.listen_period_s", t.listen_period_s),
        ("tasks.transfer_period_s", t.transfer_period_s),
        ("tasks.face_collect_period_s", t.face_collect_period_s),
        ("tasks.face_log_period_s", t.face_log_period_s),
        ("tasks.imu_period_s", t.imu_period_s),
        ("tasks.detumble_period_s", t.detumble_period_s),
        ("tasks.heater_period_s", t.heater_period_s),
    ] {
        anyhow::ensure!(period > 0, "{} must be nonzero", name);
    }
    anyhow::ensure!(t.listen_window_ms > 0, "tasks.listen_window_ms must be nonzero");
    anyhow::ensure!(t.face_log_max_kib > 0, "tasks.face_log_max_kib must be nonzero");

    info!("doctor: OK");
    Ok(())
}

fn run(cfg: &Config, sim: bool) -> Result<()> {
    anyhow::ensure!(sim, "no flight radio driver is built into this binary; run with --sim");
    info!("run: starting (sim)");

    let mut storage = FsStorage::new(cfg.satellite.storage_root.clone());
    let boot_count = next_boot_count(&mut storage);
    info!("run: boot {}", boot_count);

    let state = CubesatState::new(
        cfg.satellite.callsign.clone(),
        boot_count,
        HardwareFlags { imu: true, faces: true, power_monitor: true },
    );

    let world = sim::world(&cfg.sim);
    let mut sched = Scheduler::new(
        cfg.sched.clone(),
        state,
        PowerManager::new(cfg.power.clone()),
        PacketLink::new(SimRadio::new(&cfg.sim)),
        Box::new(storage),
        Box::new(SimBattery::new(&cfg.sim)),
        Box::new(SimImu::new(world.clone())),
        Box::new(SimFaces),
        Box::new(SimActuators::new(world)),
    );

    let t = &cfg.tasks;
    let secs = Duration::from_secs;
    sched.add_task(Box::new(BeaconTask::new(secs(t.beacon_period_s))));
    sched.add_task(Box::new(TelemetryTask::new(secs(t.telemetry_period_s))));
    sched.add_task(Box::new(ListenTask::new(
        secs(t.listen_period_s),
        Duration::from_millis(t.listen_window_ms),
        Dispatcher::new(dispatcher_config(&cfg.cdh)?),
    )));
    sched.add_task(Box::new(TransferTask::new(
        secs(t.transfer_period_s),
        cfg.transfer.clone(),
    )));
    sched.add_task(Box::new(FaceCollectTask::new(secs(t.face_collect_period_s))));
    sched.add_task(Box::new(FaceLogTask::new(
        secs(t.face_log_period_s),
        t.face_log_path.clone(),
        (t.face_log_max_kib * 1024) as usize,
    )));
    sched.add_task(Box::new(ImuDownlinkTask::new(secs(t.imu_period_s))));
    sched.add_task(Box::new(DetumbleTask::new(
        secs(t.detumble_period_s),
        secs(t.detumble_pulse_s),
        t.detumble_margin_dps,
    )));
    sched.add_task(Box::new(HeaterTask::new(secs(t.heater_period_s), secs(t.heater_cycle_s))));

    let mut platform = HostPlatform;
    let tick_interval = sched.tick_interval();
    loop {
        match sched.tick() {
            TickOutcome::Continue => platform.suspend(tick_interval),
            TickOutcome::Hibernate(slice) => platform.deep_sleep(slice),
            TickOutcome::Reset => {
                platform.reset();
                break;
            }
            TickOutcome::Shutdown => {
                info!("run: shutdown commanded, stopping");
                break;
            }
        }
    }
    Ok(())
}

/// Persistent boot counter, incremented once per process start.
fn next_boot_count(storage: &mut FsStorage) -> u32 {
    let prev: u32 = match storage.read("state/boot_count") {
        Ok(raw) => String::from_utf8_lossy(&raw).trim().parse().unwrap_or(0),
        Err(_) => 0,
    };
    let count = prev.saturating_add(1);
    if let Err(e) = storage.write("state/boot_count", count.to_string().as_bytes()) {
        warn!("run: could not persist boot count: {}", e);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.satellite.callsign, "KN6NAQ");
        assert_eq!(cfg.power.normal_v, 6.8);
        assert_eq!(cfg.transfer.chunk_size, 243);
        assert_eq!(cfg.tasks.beacon_period_s, 30);
        doctor(&cfg).unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [satellite]
            callsign = "AD0XZ"
            storage_root = "/var/sparrow"

            [power]
            normal_v = 7.0
            critical_v = 6.6
            max_enter_margin_v = 0.5
            max_exit_margin_v = 0.3
            heater_on_below_c = 15.0

            [cdh]
            auth_code = "deadbeef"
            shutdown_token = "01020304"

            [tasks]
            beacon_period_s = 45
            "#,
        )
        .unwrap();
        assert_eq!(cfg.satellite.callsign, "AD0XZ");
        assert_eq!(cfg.power.normal_v, 7.0);
        assert_eq!(cfg.tasks.beacon_period_s, 45);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.tasks.listen_period_s, 10);
        let dcfg = dispatcher_config(&cfg.cdh).unwrap();
        assert_eq!(dcfg.auth_code, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn auth_codes_must_be_four_hex_bytes() {
        assert!(parse_code("deadbeef", "x").is_ok());
        assert!(parse_code("dead", "x").is_err());
        assert!(parse_code("not hex!", "x").is_err());
    }
}
