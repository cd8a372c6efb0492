pub mod doctor;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use sparrow_link::Radio;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {0} read failed")]
    ReadFailed(&'static str),

    #[error("sensor {0} not present")]
    NotPresent(&'static str),
}

/// Coarse operating envelope. Ordering matters: a mode permits at least
/// everything the modes below it permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerMode {
    Critical,
    Minimum,
    Normal,
    Maximum,
}

impl PowerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::Critical => "critical",
            PowerMode::Minimum => "minimum",
            PowerMode::Normal => "normal",
            PowerMode::Maximum => "maximum",
        }
    }

    /// Critical and Minimum shed every load except beacon + listen.
    pub fn is_low_power(&self) -> bool {
        matches!(self, PowerMode::Critical | PowerMode::Minimum)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerConfig {
    /// Below this the satellite drops to Minimum.
    pub normal_v: f32,
    /// Below this the satellite drops to Critical.
    pub critical_v: f32,
    /// Maximum is entered above normal_v + max_enter_margin_v and held
    /// until the voltage falls under normal_v + max_exit_margin_v. The
    /// gap between the two margins is the hysteresis band.
    pub max_enter_margin_v: f32,
    pub max_exit_margin_v: f32,
    /// Battery heater engages below this temperature.
    pub heater_on_below_c: f32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            normal_v: 6.8,
            critical_v: 6.5,
            max_enter_margin_v: 0.5,
            max_exit_margin_v: 0.3,
            heater_on_below_c: 20.0,
        }
    }
}

/// One battery telemetry reading. Voltage is required to compute the
/// mode; the rest is best-effort state-of-health data.
#[derive(Debug, Clone, Default)]
pub struct PowerSample {
    pub battery_voltage: f32,
    pub system_voltage: Option<f32>,
    pub current_draw_ma: Option<f32>,
    pub battery_temp_c: Option<f32>,
    pub cpu_temp_c: Option<f32>,
}

/// Seam to the power monitor hardware.
pub trait PowerSensor {
    fn sample(&mut self) -> Result<PowerSample, SensorError>;
}

/// Sole authority for the current power mode. Nothing else in the
/// system writes the mode; everything else reads it off `CubesatState`
/// after each tick.
pub struct PowerManager {
    cfg: PowerConfig,
    mode: PowerMode,
    last_sample: Option<PowerSample>,
}

impl PowerManager {
    pub fn new(cfg: PowerConfig) -> Self {
        Self { cfg, mode: PowerMode::Normal, last_sample: None }
    }

    pub fn mode(&self) -> PowerMode {
        self.mode
    }

    pub fn last_sample(&self) -> Option<&PowerSample> {
        self.last_sample.as_ref()
    }

    /// Re-evaluate the power mode from a fresh battery reading and park
    /// or wake the radio accordingly. A failed sensor read keeps the
    /// previous mode; the manager never takes the scheduler down.
    pub fn update(&mut self, sensor: &mut dyn PowerSensor, radio: &mut dyn Radio) -> PowerMode {
        let sample = match sensor.sample() {
            Ok(s) => s,
            Err(e) => {
                warn!("power: sensor read failed, holding {} mode: {}", self.mode.as_str(), e);
                return self.mode;
            }
        };

        let next = mode_for_voltage(&self.cfg, self.mode, sample.battery_voltage);
        if next != self.mode {
            info!(
                "power: {} -> {} (vbatt={:.2}V)",
                self.mode.as_str(),
                next.as_str(),
                sample.battery_voltage
            );
        }
        self.mode = next;
        self.last_sample = Some(sample);

        if self.mode.is_low_power() {
            radio.set_transmit_enable(false);
            radio.sleep();
        } else {
            radio.set_transmit_enable(true);
            radio.wake();
        }
        self.mode
    }

    /// Heater decision for the battery heater task.
    pub fn heater_needed(&self) -> bool {
        match self.last_sample.as_ref().and_then(|s| s.battery_temp_c) {
            Some(t) => t < self.cfg.heater_on_below_c,
            None => false,
        }
    }
}

/// Pure mode step function. Thresholds are checked most-severe first so
/// the Critical band is reachable, and Maximum exit uses its own margin
/// to avoid chattering at the boundary.
pub fn mode_for_voltage(cfg: &PowerConfig, current: PowerMode, v: f32) -> PowerMode {
    if v < cfg.critical_v {
        PowerMode::Critical
    } else if v < cfg.normal_v {
        PowerMode::Minimum
    } else if v > cfg.normal_v + cfg.max_enter_margin_v {
        PowerMode::Maximum
    } else if current == PowerMode::Maximum && v >= cfg.normal_v + cfg.max_exit_margin_v {
        // Hysteresis hold: entered Maximum above +enter margin, stay
        // until we fall below +exit margin.
        PowerMode::Maximum
    } else {
        PowerMode::Normal
    }
}
