//! Bench satellite: simulated radio, sensors and actuators so `sparrow
//! run --sim` exercises the whole flight loop on a desk.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

use sparrow_link::{LinkError, Radio};
use sparrow_power::{PowerSample, PowerSensor, SensorError};
use sparrow_sched::{
    Actuators, Axis, FaceReading, FaceSensors, ImuReading, ImuSensor, Platform,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub seed: u64,
    /// Chance a transmitted frame is lost on the air.
    pub drop_rate: f32,
    /// Chance a receive window picks up band noise instead of silence.
    pub noise_rate: f32,
    pub batt_low_v: f32,
    pub batt_high_v: f32,
    pub batt_step_v: f32,
    /// Initial tumble rate per axis, degrees per second.
    pub spin_dps: [f32; 3],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            drop_rate: 0.10,
            noise_rate: 0.05,
            batt_low_v: 6.3,
            batt_high_v: 7.6,
            batt_step_v: 0.05,
            spin_dps: [3.0, -2.0, 1.0],
        }
    }
}

// ----- Radio -----

pub struct SimRadio {
    rng: StdRng,
    drop_rate: f32,
    noise_rate: f32,
    asleep: bool,
    tx_enabled: bool,
    last_rssi: Option<i16>,
}

impl SimRadio {
    pub fn new(cfg: &SimConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            drop_rate: cfg.drop_rate,
            noise_rate: cfg.noise_rate,
            asleep: false,
            tx_enabled: true,
            last_rssi: None,
        }
    }
}

impl Radio for SimRadio {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.asleep {
            return Err(LinkError::Radio("radio asleep".into()));
        }
        if !self.tx_enabled {
            return Err(LinkError::Radio("transmit disabled".into()));
        }
        if self.rng.gen::<f32>() < self.drop_rate {
            // The sender never learns; the link layer sees a clean send.
            debug!("sim: {} byte frame lost on the air", frame.len());
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        thread::sleep(timeout.min(Duration::from_millis(25)));
        if self.asleep {
            return Ok(None);
        }
        if self.rng.gen::<f32>() < self.noise_rate {
            let len = self.rng.gen_range(1..32);
            let noise: Vec<u8> = (0..len).map(|_| self.rng.gen()).collect();
            self.last_rssi = Some(-(self.rng.gen_range(90..120) as i16));
            return Ok(Some(noise));
        }
        Ok(None)
    }

    fn last_rssi(&self) -> Option<i16> {
        self.last_rssi
    }

    fn sleep(&mut self) {
        self.asleep = true;
    }

    fn wake(&mut self) {
        self.asleep = false;
    }

    fn set_transmit_enable(&mut self, enabled: bool) {
        self.tx_enabled = enabled;
    }
}

// ----- Power monitor -----

/// Triangle-wave battery: charges toward `high`, discharges toward
/// `low`, so a long sim run walks through every power mode.
pub struct SimBattery {
    v: f32,
    step: f32,
    low: f32,
    high: f32,
}

impl SimBattery {
    pub fn new(cfg: &SimConfig) -> Self {
        Self {
            v: cfg.batt_high_v,
            step: -cfg.batt_step_v.abs(),
            low: cfg.batt_low_v,
            high: cfg.batt_high_v,
        }
    }
}

impl PowerSensor for SimBattery {
    fn sample(&mut self) -> Result<PowerSample, SensorError> {
        self.v += self.step;
        if self.v <= self.low || self.v >= self.high {
            self.v = self.v.clamp(self.low, self.high);
            self.step = -self.step;
        }
        Ok(PowerSample {
            battery_voltage: self.v,
            system_voltage: Some(self.v - 0.15),
            current_draw_ma: Some(180.0),
            battery_temp_c: Some(12.0),
            cpu_temp_c: Some(28.0),
        })
    }
}

// ----- Attitude world: IMU and magnetorquers share the spin state -----

#[derive(Debug)]
pub struct SimWorld {
    pub spin_dps: [f32; 3],
}

pub type SharedWorld = Rc<RefCell<SimWorld>>;

pub fn world(cfg: &SimConfig) -> SharedWorld {
    Rc::new(RefCell::new(SimWorld { spin_dps: cfg.spin_dps }))
}

pub struct SimImu {
    world: SharedWorld,
}

impl SimImu {
    pub fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

impl ImuSensor for SimImu {
    fn read(&mut self) -> Result<ImuReading, SensorError> {
        Ok(ImuReading {
            gyro_dps: self.world.borrow().spin_dps,
            accel_g: [0.0, 0.0, 0.01],
            mag_ut: Some([22.0, -8.0, 40.0]),
        })
    }
}

pub struct SimActuators {
    world: SharedWorld,
}

impl SimActuators {
    pub fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

impl Actuators for SimActuators {
    fn pulse(&mut self, axis: Axis, dur: Duration) -> Result<(), SensorError> {
        let i = match axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        };
        let mut w = self.world.borrow_mut();
        w.spin_dps[i] *= 0.5;
        info!("sim: torquer pulse {:?} for {:?}, spin now {:.2} dps", axis, dur, w.spin_dps[i]);
        Ok(())
    }

    fn run_heater(&mut self, dur: Duration) -> Result<(), SensorError> {
        info!("sim: heater cycle {:?}", dur);
        Ok(())
    }
}

// ----- Face boards -----

pub struct SimFaces;

impl FaceSensors for SimFaces {
    fn read_all(&mut self) -> Result<Vec<FaceReading>, SensorError> {
        Ok((0..5u8)
            .map(|face| FaceReading {
                face,
                temp_c: Some(8.0 + face as f32 * 3.5),
                lux: Some(if face % 2 == 0 { 900.0 } else { 40.0 }),
            })
            .collect())
    }
}

// ----- Host platform -----

pub struct HostPlatform;

impl Platform for HostPlatform {
    fn suspend(&mut self, dur: Duration) {
        thread::sleep(dur);
    }

    fn deep_sleep(&mut self, wake_after: Duration) {
        // The bench compresses hibernation so a sim run stays watchable.
        info!("sim: deep sleep for {:?} (compressed)", wake_after);
        thread::sleep(wake_after.min(Duration::from_secs(2)));
    }

    fn reset(&mut self) {
        info!("sim: platform reset requested, ending run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_walks_between_its_bounds() {
        let cfg = SimConfig::default();
        let mut batt = SimBattery::new(&cfg);
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..200 {
            let v = batt.sample().unwrap().battery_voltage;
            assert!(v >= cfg.batt_low_v && v <= cfg.batt_high_v);
            seen_low |= v <= cfg.batt_low_v + cfg.batt_step_v;
            seen_high |= v >= cfg.batt_high_v - cfg.batt_step_v;
        }
        assert!(seen_low && seen_high);
    }

    #[test]
    fn parked_radio_neither_sends_nor_hears() {
        let mut radio = SimRadio::new(&SimConfig::default());
        radio.sleep();
        assert!(radio.send(b"hi").is_err());
        assert!(radio.receive(Duration::from_millis(1)).unwrap().is_none());
        radio.wake();
        radio.set_transmit_enable(false);
        assert!(radio.send(b"hi").is_err());
    }

    #[test]
    fn torquer_pulse_damps_the_shared_spin() {
        let w = world(&SimConfig::default());
        let mut imu = SimImu::new(w.clone());
        let mut act = SimActuators::new(w);

        let before = imu.read().unwrap().gyro_dps[0];
        act.pulse(Axis::X, Duration::from_secs(7)).unwrap();
        let after = imu.read().unwrap().gyro_dps[0];
        assert!(after.abs() < before.abs());
    }
}
