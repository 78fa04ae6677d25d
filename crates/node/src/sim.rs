//! Stateful grow-box climate simulator for local development.
//!
//! Models a small tent well enough to close the loop with the hub:
//! - Air temperature and humidity relax toward a scenario ambient
//! - Random walk on top, so consecutive readings stay coherent
//! - Four temperature and four humidity probes with a permanent offset,
//!   per-reading noise and occasional dropouts (published as `null`)
//! - Closed-loop response to the actuator commands the hub sends

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild room, inside the seedling band most of the time.
    Stable,
    /// Unheated room: the heater has to work.
    Cold,
    /// Damp room: fan and extraction keep busy.
    Humid,
    /// Noisy probes that drop out often.  Exercises the hub's averaging.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cold" => Self::Cold,
            "humid" => Self::Humid,
            "flaky" => Self::Flaky,
            _ => Self::Stable, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Cold => write!(f, "cold"),
            Self::Humid => write!(f, "humid"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actuators {
    pub light: bool,
    pub fan: bool,
    pub heater: bool,
    pub extraction_pump: bool,
    pub water_pump: bool,
}

impl Actuators {
    /// Apply a command addressed by its device key (`luce_led`, `ventola`,
    /// ...).  Returns `false` for an unknown key.
    pub fn set(&mut self, key: &str, on: bool) -> bool {
        let slot = match key {
            "luce_led" => &mut self.light,
            "ventola" => &mut self.fan,
            "resistenza" => &mut self.heater,
            "pompa_aspirazione" => &mut self.extraction_pump,
            "pompa_acqua" => &mut self.water_pump,
            _ => return false,
        };
        *slot = on;
        true
    }
}

// Per-sample effect of each actuator.
const HEATER_DEG: f64 = 0.8;
const LAMP_DEG: f64 = 0.15;
const FAN_DEG: f64 = -0.6;
const FAN_HUM: f64 = -1.5;
const EXTRACTION_HUM: f64 = -1.5;
const WATER_PUMP_HUM: f64 = 2.0;

// ---------------------------------------------------------------------------
// Probe frame
// ---------------------------------------------------------------------------

/// One round of probe readings; `None` is a probe that did not answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub temperatures: [Option<f64>; 4],
    pub humidities: [Option<f64>; 4],
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct GrowBoxSim {
    temperature: f64,
    humidity: f64,

    ambient_temperature: f64,
    ambient_humidity: f64,
    mean_reversion: f64,
    walk_sigma: f64,

    temp_offsets: [f64; 4],
    hum_offsets: [f64; 4],
    noise_sigma: f64,
    dropout_prob: f64,

    actuators: Actuators,
}

impl GrowBoxSim {
    pub fn new(scenario: Scenario) -> Self {
        // (ambient °C, ambient %RH, walk sigma, probe noise, dropout prob)
        let (amb_t, amb_h, walk_sigma, noise_sigma, dropout_prob) = match scenario {
            Scenario::Stable => (22.5, 67.0, 0.05, 0.1, 0.0),
            Scenario::Cold => (15.0, 60.0, 0.05, 0.15, 0.02),
            Scenario::Humid => (25.0, 85.0, 0.08, 0.2, 0.02),
            Scenario::Flaky => (22.0, 60.0, 0.2, 0.8, 0.15),
        };

        let offset = |sigma: f64| -> [f64; 4] { std::array::from_fn(|_| gaussian(0.0, sigma)) };

        Self {
            temperature: amb_t,
            humidity: amb_h,
            ambient_temperature: amb_t,
            ambient_humidity: amb_h,
            mean_reversion: 0.05,
            walk_sigma,
            temp_offsets: offset(0.2),
            hum_offsets: offset(1.0),
            noise_sigma,
            dropout_prob,
            actuators: Actuators::default(),
        }
    }

    pub fn actuators(&self) -> Actuators {
        self.actuators
    }

    /// Apply an actuator command by device key.  Returns `false` for an
    /// unknown key.
    pub fn set_actuator(&mut self, key: &str, on: bool) -> bool {
        self.actuators.set(key, on)
    }

    /// True air temperature (°C), before probe offsets and noise.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// True relative humidity (%), before probe offsets and noise.
    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    /// Advance the climate by one sampling period.
    pub fn step(&mut self) {
        let a = self.actuators;

        let mut dt = self.mean_reversion * (self.ambient_temperature - self.temperature);
        let mut dh = self.mean_reversion * (self.ambient_humidity - self.humidity);

        if a.heater {
            dt += HEATER_DEG;
        }
        if a.light {
            dt += LAMP_DEG;
        }
        if a.fan {
            dt += FAN_DEG;
            dh += FAN_HUM;
        }
        if a.extraction_pump {
            dh += EXTRACTION_HUM;
        }
        if a.water_pump {
            dh += WATER_PUMP_HUM;
        }

        self.temperature = (self.temperature + dt + gaussian(0.0, self.walk_sigma)).clamp(-10.0, 50.0);
        self.humidity = (self.humidity + dh + gaussian(0.0, self.walk_sigma * 4.0)).clamp(0.0, 100.0);
    }

    /// Read every probe once.
    pub fn sample(&self) -> Frame {
        let probe = |value: f64, offset: f64, lo: f64, hi: f64| -> Option<f64> {
            if fastrand::f64() < self.dropout_prob {
                return None;
            }
            Some(round1((value + offset + gaussian(0.0, self.noise_sigma)).clamp(lo, hi)))
        };

        Frame {
            temperatures: std::array::from_fn(|i| probe(self.temperature, self.temp_offsets[i], -40.0, 80.0)),
            humidities: std::array::from_fn(|i| probe(self.humidity, self.hum_offsets[i], 0.0, 100.0)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
