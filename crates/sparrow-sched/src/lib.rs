pub mod tasks;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sparrow_link::{PacketLink, Radio};
use sparrow_power::{PowerManager, PowerMode, PowerSensor, SensorError};
use sparrow_transfer::storage::Storage;

// ----- Collaborator hardware seams -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImuReading {
    /// Angular rate per axis, degrees per second.
    pub gyro_dps: [f32; 3],
    pub accel_g: [f32; 3],
    pub mag_ut: Option<[f32; 3]>,
}

pub trait ImuSensor {
    fn read(&mut self) -> Result<ImuReading, SensorError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FaceReading {
    pub face: u8,
    pub temp_c: Option<f32>,
    pub lux: Option<f32>,
}

/// The solar-face sensor boards. Reading them is best-effort per face.
pub trait FaceSensors {
    fn read_all(&mut self) -> Result<Vec<FaceReading>, SensorError>;
}

/// Magnetorquer drivers and the battery heater switch. Every actuation
/// is bounded by construction: the implementation returns only after the
/// pulse or heater cycle has ended.
pub trait Actuators {
    fn pulse(&mut self, axis: Axis, dur: Duration) -> Result<(), SensorError>;
    fn run_heater(&mut self, dur: Duration) -> Result<(), SensorError>;
}

/// Host/MCU services the flight loop hands off to but never implements.
pub trait Platform {
    /// Light sleep between ticks.
    fn suspend(&mut self, dur: Duration);
    /// Power down until the wake alarm. State does not survive this.
    fn deep_sleep(&mut self, wake_after: Duration);
    fn reset(&mut self);
}

// ----- Shared flight state -----

#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareFlags {
    pub imu: bool,
    pub faces: bool,
    pub power_monitor: bool,
}

impl HardwareFlags {
    pub fn summary(&self) -> String {
        format!(
            "imu={} faces={} pwr={}",
            self.imu as u8, self.faces as u8, self.power_monitor as u8
        )
    }
}

/// Flight state shared across tasks. Lives on the scheduler and is
/// threaded through each tick by `&mut`; the loop is single-threaded,
/// so there is exactly one writer at any point by construction.
#[derive(Debug)]
pub struct CubesatState {
    pub power_mode: PowerMode,
    pub boot_count: u32,
    pub callsign: String,
    pub hardware: HardwareFlags,
    /// Set by the dispatcher, honored at the next tick boundary.
    pub shutdown_requested: bool,
    pub reset_requested: bool,
    started: Instant,
}

impl CubesatState {
    pub fn new(callsign: String, boot_count: u32, hardware: HardwareFlags) -> Self {
        Self {
            power_mode: PowerMode::Normal,
            boot_count,
            callsign,
            hardware,
            shutdown_requested: false,
            reset_requested: false,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

// ----- Tasks -----

/// Everything a task may touch during one invocation. Collaborators are
/// borrowed from the scheduler for the duration of `run` only.
pub struct TaskCtx<'a, R: Radio> {
    pub state: &'a mut CubesatState,
    pub link: &'a mut PacketLink<R>,
    pub storage: &'a mut dyn Storage,
    pub power: &'a PowerManager,
    pub imu: &'a mut dyn ImuSensor,
    pub faces: &'a mut dyn FaceSensors,
    pub actuators: &'a mut dyn Actuators,
    pub scratch: &'a mut FaceScratch,
}

/// Face data handed from the collection task to the logging task.
#[derive(Debug, Default)]
pub struct FaceScratch {
    pub readings: Vec<FaceReading>,
    pub fresh: bool,
}

pub trait Task<R: Radio> {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;
    fn permitted(&self, mode: PowerMode) -> bool;
    fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()>;
}

struct Entry<R: Radio> {
    task: Box<dyn Task<R>>,
    last_run: Option<Instant>,
    failures: u32,
}

impl<R: Radio> Entry<R> {
    fn due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(t) => now.duration_since(t) >= self.task.period(),
        }
    }
}

// ----- Scheduler -----

#[derive(Debug, Clone, Deserialize)]
pub struct SchedConfig {
    pub tick_interval_ms: u64,
    /// Hibernation slice after a Minimum-mode tick.
    pub short_hibernate_s: u64,
    /// Hibernation slice after a Critical-mode tick.
    pub long_hibernate_s: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            short_hibernate_s: 120,
            long_hibernate_s: 600,
        }
    }
}

/// What the outer loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Low-power tick ended; deep-sleep for the given slice.
    Hibernate(Duration),
    Reset,
    Shutdown,
}

/// Cooperative tick-driven task runner. One tick: re-evaluate power,
/// honor pending shutdown/reset, then round-robin every task that is
/// both due and permitted by the mode. A failing task is logged and
/// skipped; it never takes its siblings or the loop down.
pub struct Scheduler<R: Radio> {
    cfg: SchedConfig,
    state: CubesatState,
    power: PowerManager,
    link: PacketLink<R>,
    storage: Box<dyn Storage>,
    power_sensor: Box<dyn PowerSensor>,
    imu: Box<dyn ImuSensor>,
    faces: Box<dyn FaceSensors>,
    actuators: Box<dyn Actuators>,
    scratch: FaceScratch,
    tasks: Vec<Entry<R>>,
}

impl<R: Radio> Scheduler<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SchedConfig,
        state: CubesatState,
        power: PowerManager,
        link: PacketLink<R>,
        storage: Box<dyn Storage>,
        power_sensor: Box<dyn PowerSensor>,
        imu: Box<dyn ImuSensor>,
        faces: Box<dyn FaceSensors>,
        actuators: Box<dyn Actuators>,
    ) -> Self {
        Self {
            cfg,
            state,
            power,
            link,
            storage,
            power_sensor,
            imu,
            faces,
            actuators,
            scratch: FaceScratch::default(),
            tasks: Vec::new(),
        }
    }

    pub fn add_task(&mut self, task: Box<dyn Task<R>>) {
        info!("sched: registered task {} ({:?})", task.name(), task.period());
        self.tasks.push(Entry { task, last_run: None, failures: 0 });
    }

    pub fn state(&self) -> &CubesatState {
        &self.state
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.cfg.tick_interval_ms)
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// One scheduler tick at an injected instant (tests drive this
    /// directly with synthetic clocks).
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        // Shutdown and reset are honored only here, at the boundary: a
        // command that lands mid-tick lets the current tick finish.
        if self.state.shutdown_requested {
            info!("sched: shutdown flag set, stopping task loop");
            return TickOutcome::Shutdown;
        }
        if self.state.reset_requested {
            info!("sched: reset flag set, handing off to platform");
            return TickOutcome::Reset;
        }

        // Power first; everything after this sees the fresh mode.
        let mode = self.power.update(self.power_sensor.as_mut(), self.link.radio_mut());
        self.state.power_mode = mode;

        for entry in &mut self.tasks {
            if !entry.due(now) {
                continue;
            }
            if !entry.task.permitted(mode) {
                debug!("sched: {} not permitted in {} mode", entry.task.name(), mode.as_str());
                continue;
            }
            entry.last_run = Some(now);

            let mut ctx = TaskCtx {
                state: &mut self.state,
                link: &mut self.link,
                storage: self.storage.as_mut(),
                power: &self.power,
                imu: self.imu.as_mut(),
                faces: self.faces.as_mut(),
                actuators: self.actuators.as_mut(),
                scratch: &mut self.scratch,
            };
            if let Err(e) = entry.task.run(&mut ctx) {
                entry.failures += 1;
                warn!(
                    "sched: task {} failed ({} total): {:#}",
                    entry.task.name(),
                    entry.failures,
                    e
                );
            }
        }

        match mode {
            PowerMode::Critical => {
                TickOutcome::Hibernate(Duration::from_secs(self.cfg.long_hibernate_s))
            }
            PowerMode::Minimum => {
                TickOutcome::Hibernate(Duration::from_secs(self.cfg.short_hibernate_s))
            }
            PowerMode::Normal | PowerMode::Maximum => TickOutcome::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::{
        noop_hw, sched_with, CountingTask, FailingTask, FixedPowerSensor,
    };
    use sparrow_power::PowerConfig;

    #[test]
    fn failing_task_never_starves_its_siblings() {
        let mut sched = sched_with(FixedPowerSensor(7.0), noop_hw());
        sched.add_task(Box::new(FailingTask::new("flaky", Duration::from_secs(1))));
        let counter = CountingTask::new("steady", Duration::from_secs(1));
        let count = counter.count.clone();
        sched.add_task(Box::new(counter));

        let t0 = Instant::now();
        for i in 0..100u64 {
            let out = sched.tick_at(t0 + Duration::from_secs(i));
            assert_eq!(out, TickOutcome::Continue);
        }
        assert_eq!(count.get(), 100);
    }

    #[test]
    fn tasks_run_only_when_due() {
        let mut sched = sched_with(FixedPowerSensor(7.0), noop_hw());
        let slow = CountingTask::new("slow", Duration::from_secs(60));
        let count = slow.count.clone();
        sched.add_task(Box::new(slow));

        let t0 = Instant::now();
        sched.tick_at(t0);
        sched.tick_at(t0 + Duration::from_secs(1));
        sched.tick_at(t0 + Duration::from_secs(59));
        assert_eq!(count.get(), 1);
        sched.tick_at(t0 + Duration::from_secs(60));
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn low_power_mode_gates_tasks_and_hibernates() {
        let mut sched = sched_with(FixedPowerSensor(6.2), noop_hw());
        let gated = CountingTask::new("payload", Duration::from_secs(1)).low_power_blocked();
        let gated_count = gated.count.clone();
        sched.add_task(Box::new(gated));
        let always = CountingTask::new("beaconish", Duration::from_secs(1));
        let always_count = always.count.clone();
        sched.add_task(Box::new(always));

        let out = sched.tick_at(Instant::now());
        // 6.2V is Critical: long hibernation, payload task skipped.
        assert_eq!(out, TickOutcome::Hibernate(Duration::from_secs(600)));
        assert_eq!(gated_count.get(), 0);
        assert_eq!(always_count.get(), 1);
    }

    #[test]
    fn minimum_mode_gets_the_short_hibernation() {
        let mut sched = sched_with(FixedPowerSensor(6.6), noop_hw());
        let out = sched.tick_at(Instant::now());
        assert_eq!(out, TickOutcome::Hibernate(Duration::from_secs(120)));
    }

    #[test]
    fn shutdown_lands_at_the_next_tick_boundary() {
        struct ShutdownTask;
        impl<R: Radio> Task<R> for ShutdownTask {
            fn name(&self) -> &'static str {
                "shutdown-now"
            }
            fn period(&self) -> Duration {
                Duration::from_secs(1)
            }
            fn permitted(&self, _mode: PowerMode) -> bool {
                true
            }
            fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
                ctx.state.shutdown_requested = true;
                Ok(())
            }
        }

        let mut sched = sched_with(FixedPowerSensor(7.0), noop_hw());
        sched.add_task(Box::new(ShutdownTask));
        let later = CountingTask::new("after", Duration::from_secs(1));
        let later_count = later.count.clone();
        sched.add_task(Box::new(later));

        let t0 = Instant::now();
        // The tick that sets the flag still finishes its task list.
        assert_eq!(sched.tick_at(t0), TickOutcome::Continue);
        assert_eq!(later_count.get(), 1);
        // The next boundary honors it before running anything.
        assert_eq!(sched.tick_at(t0 + Duration::from_secs(1)), TickOutcome::Shutdown);
        assert_eq!(later_count.get(), 1);
    }

    #[test]
    fn power_mode_is_refreshed_before_tasks_run() {
        struct ModeWitness {
            saw: std::rc::Rc<std::cell::Cell<Option<PowerMode>>>,
        }
        impl<R: Radio> Task<R> for ModeWitness {
            fn name(&self) -> &'static str {
                "witness"
            }
            fn period(&self) -> Duration {
                Duration::from_secs(1)
            }
            fn permitted(&self, _mode: PowerMode) -> bool {
                true
            }
            fn run(&mut self, ctx: &mut TaskCtx<'_, R>) -> anyhow::Result<()> {
                self.saw.set(Some(ctx.state.power_mode));
                Ok(())
            }
        }

        let mut sched = sched_with(FixedPowerSensor(7.5), noop_hw());
        let saw = std::rc::Rc::new(std::cell::Cell::new(None));
        sched.add_task(Box::new(ModeWitness { saw: saw.clone() }));

        sched.tick_at(Instant::now());
        assert_eq!(saw.get(), Some(PowerMode::Maximum));
    }

    #[test]
    fn default_thresholds_pass_the_power_doctor() {
        // Guards the config defaults the scheduler hands to PowerManager.
        sparrow_power::doctor::check_thresholds(&PowerConfig::default()).unwrap();
    }
}
