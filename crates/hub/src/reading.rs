//! Sensor payload for one automation tick and the probe aggregator.

use serde::{Deserialize, Serialize};

/// One grow-box telemetry message: up to four temperature and four humidity
/// probes (any of which may be absent) plus, from some firmwares, the actual
/// actuator states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub ts: Option<i64>,

    #[serde(default)]
    pub temperature_1: Option<f64>,
    #[serde(default)]
    pub temperature_2: Option<f64>,
    #[serde(default)]
    pub temperature_3: Option<f64>,
    #[serde(default)]
    pub temperature_4: Option<f64>,

    #[serde(default)]
    pub humidity_1: Option<f64>,
    #[serde(default)]
    pub humidity_2: Option<f64>,
    #[serde(default)]
    pub humidity_3: Option<f64>,
    #[serde(default)]
    pub humidity_4: Option<f64>,

    #[serde(default)]
    pub actuator_states: Option<ReportedStates>,
}

/// Actuator states as observed by the device itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedStates {
    #[serde(default, rename = "luce_led", alias = "light")]
    pub light: Option<bool>,
}

/// Mean temperature (°C) and relative humidity (%) over the present probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Averages {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl SensorReading {
    pub fn temperatures(&self) -> [Option<f64>; 4] {
        [
            self.temperature_1,
            self.temperature_2,
            self.temperature_3,
            self.temperature_4,
        ]
    }

    pub fn humidities(&self) -> [Option<f64>; 4] {
        [
            self.humidity_1,
            self.humidity_2,
            self.humidity_3,
            self.humidity_4,
        ]
    }

    pub fn averages(&self) -> Averages {
        Averages {
            temperature: mean(&self.temperatures()),
            humidity: mean(&self.humidities()),
        }
    }

    /// Light ground truth, when the payload carries one.
    pub fn reported_light(&self) -> Option<bool> {
        self.actuator_states.and_then(|s| s.light)
    }
}

/// Arithmetic mean of the present, non-NaN values.  No rounding.
pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let (sum, n) = values
        .iter()
        .flatten()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0_u32), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}
