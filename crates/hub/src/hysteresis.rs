//! Two-threshold controller with a midpoint release for the "raise" side.
//!
//! Once a reading drops below the band, the raise actuator (heater, water
//! pump) stays latched on until the reading climbs back to the band's
//! midpoint.  Readings above the band are corrected at once: raise off,
//! lower actuator (fan) on, latch cleared.
//!
//! ```text
//!            value < min                     value >= mid (in band)
//!   Idle ─────────────────▶ LatchedLow ───────────────────────────▶ Idle
//!    ▲                          │
//!    └──────[value > max]───────┘
//! ```

use serde::Serialize;

use crate::ports::{Actuator, ActuatorAction};
use crate::targets::Band;

/// Controlled quantity; selects which actuators a decision drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Temperature,
    Humidity,
}

impl Quantity {
    pub fn raise(self) -> Actuator {
        match self {
            Self::Temperature => Actuator::Heater,
            Self::Humidity => Actuator::WaterPump,
        }
    }

    pub fn lower(self) -> Actuator {
        Actuator::Fan
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No command this tick.
    Hold,
    RaiseOn,
    RaiseOff,
    RaiseOffLowerOn,
}

impl Decision {
    /// Commands to issue, in order.  For humidity the extraction pump is
    /// forced off whenever the raise or lower actuator is engaged.
    pub fn actions(self, quantity: Quantity) -> Vec<ActuatorAction> {
        let raise = quantity.raise();
        let lower = quantity.lower();
        let mut actions = match self {
            Self::Hold => return Vec::new(),
            Self::RaiseOn => vec![ActuatorAction::on(raise)],
            Self::RaiseOff => vec![ActuatorAction::off(raise)],
            Self::RaiseOffLowerOn => vec![ActuatorAction::off(raise), ActuatorAction::on(lower)],
        };
        if quantity == Quantity::Humidity && self != Self::RaiseOff {
            actions.push(ActuatorAction::off(Actuator::ExtractionPump));
        }
        actions
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hysteresis {
    latched_low: bool,
}

impl Hysteresis {
    pub fn latched_low(&self) -> bool {
        self.latched_low
    }

    /// Advance with a new reading.  A missing reading changes nothing.
    pub fn step(&mut self, value: Option<f64>, band: Band) -> Decision {
        let Some(v) = value else {
            return Decision::Hold;
        };

        if v < band.min {
            self.latched_low = true;
            return Decision::RaiseOn;
        }
        if v > band.max {
            self.latched_low = false;
            return Decision::RaiseOffLowerOn;
        }

        if self.latched_low && v < band.mid() {
            return Decision::Hold;
        }
        self.latched_low = false;
        Decision::RaiseOff
    }
}
