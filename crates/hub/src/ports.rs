//! Port traits: the boundary between the automation core and the outside
//! world.
//!
//! ```text
//!   MQTT / relay adapter ──▶ ActuatorPort ──▶ GrowController
//!   SQLite adapter       ──▶ ConfigStore  ──▶ GrowController
//! ```
//!
//! The controller only ever issues the closed set of [`ActuatorAction`]s by
//! name; adapters translate them into device commands.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ControlError;
use crate::phase::{CultivationCycle, GrowthPhase};

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

/// Physical actuators of a grow box.  Serialised with the names used by the
/// persisted state and the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Actuator {
    #[serde(rename = "luce_led")]
    Light,
    #[serde(rename = "ventola")]
    Fan,
    #[serde(rename = "resistenza")]
    Heater,
    #[serde(rename = "pompa_aspirazione")]
    ExtractionPump,
    #[serde(rename = "pompa_acqua")]
    WaterPump,
}

impl Actuator {
    pub const ALL: [Actuator; 5] = [
        Actuator::Light,
        Actuator::Fan,
        Actuator::Heater,
        Actuator::ExtractionPump,
        Actuator::WaterPump,
    ];

    /// Persisted / device-side name.
    pub fn key(self) -> &'static str {
        match self {
            Self::Light => "luce_led",
            Self::Fan => "ventola",
            Self::Heater => "resistenza",
            Self::ExtractionPump => "pompa_aspirazione",
            Self::WaterPump => "pompa_acqua",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }

    /// Symbolic name used in action identifiers (`heater_on`, ...).
    fn symbol(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Fan => "fan",
            Self::Heater => "heater",
            Self::ExtractionPump => "extraction_pump",
            Self::WaterPump => "water_pump",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One of the ten symbolic commands (`heater_on`, `light_off`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActuatorAction {
    pub actuator: Actuator,
    pub on: bool,
}

impl ActuatorAction {
    pub fn on(actuator: Actuator) -> Self {
        Self { actuator, on: true }
    }

    pub fn off(actuator: Actuator) -> Self {
        Self {
            actuator,
            on: false,
        }
    }
}

impl fmt::Display for ActuatorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.on { "on" } else { "off" };
        write!(f, "{}_{suffix}", self.actuator.symbol())
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Write-side port: turns a device on or off.
///
/// Implementations apply their own timeouts; the controller treats a call as
/// bounded and never retries within a tick.
#[async_trait]
pub trait ActuatorPort: Send + Sync {
    async fn execute(&self, sensor_name: &str, action: ActuatorAction) -> Result<(), ControlError>;
}

/// Durable per-sensor configuration: phase, cultivation dates and the last
/// commanded state of each actuator.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_phase(&self, sensor_name: &str) -> Result<Option<GrowthPhase>, ControlError>;

    /// Overwrite the phase.  Entering vegetative or flowering stamps the
    /// matching start date with `now` if it is not already set.
    async fn set_phase(
        &self,
        sensor_name: &str,
        phase: GrowthPhase,
        now: OffsetDateTime,
    ) -> Result<(), ControlError>;

    async fn get_cultivation(&self, sensor_name: &str) -> Result<CultivationCycle, ControlError>;

    async fn start_cultivation(
        &self,
        sensor_name: &str,
        now: OffsetDateTime,
    ) -> Result<(), ControlError>;

    /// Clear phase, dates and every actuator state for the sensor.
    async fn end_cultivation(&self, sensor_name: &str) -> Result<(), ControlError>;

    /// Last commanded state; `false` when never recorded.
    async fn get_actuator_state(
        &self,
        sensor_name: &str,
        actuator: Actuator,
    ) -> Result<bool, ControlError>;

    async fn set_actuator_state(
        &self,
        sensor_name: &str,
        actuator: Actuator,
        value: bool,
    ) -> Result<(), ControlError>;
}

// ===========================================================================
// Test doubles
// ===========================================================================
