//! The flight task set. Each task is a small struct owning its own
//! knobs; everything shared comes in through `TaskCtx`.

use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use sparrow_cdh::{CommandEffects, Dispatcher, QueryKey};
use sparrow_link::Radio;
use sparrow_power::PowerMode;
use sparrow_proto::telemetry::TelemetryFrame;
use sparrow_transfer::storage::StorageError;
use sparrow_transfer::{TransferConfig, TransferProtocol};

use crate::{Axis, Task, TaskCtx};

/// State-of-health snapshot assembled from whatever the last tick
/// learned. Missing sensors leave their fields empty.
pub fn snapshot<R: Radio>(ctx: &TaskCtx<'_, R>) -> TelemetryFrame {
    let sample = ctx.power.last_sample();
    let health = ctx.link.health();
    TelemetryFrame {
        ts_unix_ms: time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000,
        callsign: ctx.state.callsign.clone(),
        power_mode: ctx.state.power_mode.as_str().to_string(),
        boot_count: ctx.state.boot_count,
        battery_voltage: sample.map(|s| s.battery_voltage),
        system_voltage: sample.and_then(|s| s.system_voltage),
        current_draw_ma: sample.and_then(|s| s.current_draw_ma),
        battery_temp_c: sample.and_then(|s| s.battery_temp_c),
        cpu_temp_c: sample.and_then(|s| s.cpu_temp_c),
        last_rssi: health.last_rssi,
        link_quality: Some(health.quality),
    }
}

// ----- Beacon + state of health -----

/// Periodic ham beacon. Runs in every power mode; in the low modes the
/// radio may be parked and the send simply fails and is logged.
pub struct BeaconTask {
    period: Duration,
}

impl BeaconTask {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl<R: Radio> Task<R> for BeaconTask {
    fn name(&self) -> &'static str {
        "beacon"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, _mode: PowerMode) -> bool {
        true
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let line = snapshot(ctx).beacon_text();
        ctx.link.send_raw(line.as_bytes()).context("beacon send")?;
        debug!("beacon: {}", line);
        Ok(())
    }
}

/// Machine-readable state-of-health downlink, the JSON sibling of the
/// beacon line.
pub struct TelemetryTask {
    period: Duration,
}

impl TelemetryTask {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl<R: Radio> Task<R> for TelemetryTask {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, _mode: PowerMode) -> bool {
        true
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let raw = snapshot(ctx).to_bytes().context("telemetry encode")?;
        ctx.link.send_raw(&raw).context("telemetry send")?;
        Ok(())
    }
}

// ----- Listen / command dispatch -----

struct EffectsView<'a> {
    state: &'a mut crate::CubesatState,
    battery_voltage: Option<f32>,
}

impl CommandEffects for EffectsView<'_> {
    fn request_shutdown(&mut self) {
        self.state.shutdown_requested = true;
    }

    fn request_reset(&mut self) {
        self.state.reset_requested = true;
    }

    fn query(&mut self, key: QueryKey) -> String {
        match key {
            QueryKey::PowerMode => self.state.power_mode.as_str().to_string(),
            QueryKey::BatteryVoltage => self
                .battery_voltage
                .map(|v| format!("{:.2}V", v))
                .unwrap_or_else(|| "unknown".to_string()),
            QueryKey::BootCount => self.state.boot_count.to_string(),
            QueryKey::Hardware => self.state.hardware.summary(),
        }
    }
}

/// Listens for one receive window and hands any frame that arrives to
/// the command dispatcher.
pub struct ListenTask {
    period: Duration,
    window: Duration,
    dispatcher: Dispatcher,
}

impl ListenTask {
    pub fn new(period: Duration, window: Duration, dispatcher: Dispatcher) -> Self {
        Self { period, window, dispatcher }
    }
}

impl<R: Radio> Task<R> for ListenTask {
    fn name(&self) -> &'static str {
        "listen"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, _mode: PowerMode) -> bool {
        true
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let Some(frame) = ctx.link.receive_raw(self.window).context("listen receive")? else {
            return Ok(());
        };
        let mut fx = EffectsView {
            state: &mut *ctx.state,
            battery_voltage: ctx.power.last_sample().map(|s| s.battery_voltage),
        };
        if let Err(e) = self.dispatcher.handle(&frame, ctx.link, &mut fx) {
            // Already logged by the dispatcher; unauthenticated noise is
            // expected on a shared band.
            debug!("listen: frame dropped: {}", e);
        }
        Ok(())
    }
}

// ----- File transfer session -----

pub struct TransferTask {
    period: Duration,
    protocol: TransferProtocol,
}

impl TransferTask {
    pub fn new(period: Duration, cfg: TransferConfig) -> Self {
        Self { period, protocol: TransferProtocol::new(cfg) }
    }
}

impl<R: Radio> Task<R> for TransferTask {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, mode: PowerMode) -> bool {
        !mode.is_low_power()
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let telemetry = snapshot(ctx).to_bytes().context("session telemetry encode")?;
        // Outcome details are logged by the protocol; no contact is the
        // normal case outside a pass.
        let _ = self.protocol.run_session(ctx.link, ctx.storage, telemetry);
        Ok(())
    }
}

// ----- Face data pipeline -----

/// Reads every face board into the shared scratch buffer.
pub struct FaceCollectTask {
    period: Duration,
}

impl FaceCollectTask {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl<R: Radio> Task<R> for FaceCollectTask {
    fn name(&self) -> &'static str {
        "face-collect"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, mode: PowerMode) -> bool {
        !mode.is_low_power()
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let readings = ctx.faces.read_all().context("face read")?;
        debug!("faces: collected {} reading(s)", readings.len());
        ctx.scratch.readings = readings;
        ctx.scratch.fresh = true;
        Ok(())
    }
}

/// Appends the latest collected face data to the on-storage log. The
/// log is a ring in file form: once it exceeds `max_bytes`, whole lines
/// fall off the front so the rewrite cost stays bounded for the life of
/// the mission.
pub struct FaceLogTask {
    period: Duration,
    log_path: String,
    max_bytes: usize,
}

impl FaceLogTask {
    pub fn new(period: Duration, log_path: String, max_bytes: usize) -> Self {
        Self { period, log_path, max_bytes }
    }
}

impl<R: Radio> Task<R> for FaceLogTask {
    fn name(&self) -> &'static str {
        "face-log"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, mode: PowerMode) -> bool {
        !mode.is_low_power()
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        if !ctx.scratch.fresh {
            debug!("face-log: nothing new to log");
            return Ok(());
        }
        let line = serde_json::json!({
            "ts_unix_ms":
                time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000,
            "faces": &ctx.scratch.readings,
        });
        let mut log = match ctx.storage.read(&self.log_path) {
            Ok(existing) => existing,
            Err(StorageError::Missing(_)) => Vec::new(),
            Err(e) => return Err(e).context("face log read"),
        };
        log.extend_from_slice(line.to_string().as_bytes());
        log.push(b'\n');
        while log.len() > self.max_bytes {
            match log.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    log.drain(..=pos);
                }
                None => log.clear(),
            }
        }
        ctx.storage.write(&self.log_path, &log).context("face log write")?;
        ctx.scratch.fresh = false;
        Ok(())
    }
}

// ----- IMU downlink -----

pub struct ImuDownlinkTask {
    period: Duration,
}

impl ImuDownlinkTask {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl<R: Radio> Task<R> for ImuDownlinkTask {
    fn name(&self) -> &'static str {
        "imu"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, mode: PowerMode) -> bool {
        !mode.is_low_power()
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let reading = ctx.imu.read().context("imu read")?;
        let raw = serde_json::to_vec(&reading).context("imu encode")?;
        ctx.link.send_raw(&raw).context("imu send")?;
        Ok(())
    }
}

// ----- Detumble -----

const DETUMBLE_RATE_THRESHOLD_DPS: f32 = 0.2;

/// Magnetorquer detumble with per-axis lockout. An axis whose rate
/// moves more than `margin` across one cycle is deemed unreliable
/// (sensor or driver misbehaving) and sits out until a clean cycle
/// re-enables it.
pub struct DetumbleTask {
    period: Duration,
    pulse: Duration,
    margin: f32,
    axis_enabled: [bool; 3],
}

impl DetumbleTask {
    pub fn new(period: Duration, pulse: Duration, margin: f32) -> Self {
        Self { period, pulse, margin, axis_enabled: [true; 3] }
    }

    pub fn axis_enabled(&self, axis: Axis) -> bool {
        self.axis_enabled[axis_index(axis)]
    }
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

impl<R: Radio> Task<R> for DetumbleTask {
    fn name(&self) -> &'static str {
        "detumble"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, mode: PowerMode) -> bool {
        !mode.is_low_power()
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        let before = ctx.imu.read().context("detumble imu read")?;

        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let i = axis_index(axis);
            if !self.axis_enabled[i] {
                debug!("detumble: {:?} locked out", axis);
                continue;
            }
            if before.gyro_dps[i].abs() > DETUMBLE_RATE_THRESHOLD_DPS {
                info!("detumble: pulsing {:?} ({:.2} dps)", axis, before.gyro_dps[i]);
                ctx.actuators.pulse(axis, self.pulse).context("detumble pulse")?;
            }
        }

        let after = ctx.imu.read().context("detumble imu re-read")?;
        for i in 0..3 {
            let moved = (after.gyro_dps[i] - before.gyro_dps[i]).abs();
            let ok = moved <= self.margin;
            if !ok && self.axis_enabled[i] {
                warn!("detumble: axis {} moved {:.2} dps in one cycle, locking out", i, moved);
            }
            self.axis_enabled[i] = ok;
        }
        Ok(())
    }
}

// ----- Battery heater -----

/// Bounded heater cycle when the pack runs cold. The actuator call
/// returns only after the cycle ends, so the tick stays bounded.
pub struct HeaterTask {
    period: Duration,
    cycle: Duration,
}

impl HeaterTask {
    pub fn new(period: Duration, cycle: Duration) -> Self {
        Self { period, cycle }
    }
}

impl<R: Radio> Task<R> for HeaterTask {
    fn name(&self) -> &'static str {
        "heater"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn permitted(&self, _mode: PowerMode) -> bool {
        // Battery safety runs in every mode.
        true
    }

    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
        if !ctx.power.heater_needed() {
            debug!("heater: battery warm enough");
            return Ok(());
        }
        info!("heater: running {:?} cycle", self.cycle);
        ctx.actuators.run_heater(self.cycle).context("heater cycle")?;
        Ok(())
    }
}

// ----- Test rig -----
