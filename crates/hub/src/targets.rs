//! Phase-dependent environmental targets.
//!
//! | phase      | humidity %                    | temp light on | temp light off |
//! |------------|-------------------------------|---------------|----------------|
//! | seedling   | 65–70                         | 20–25         | 15–21          |
//! | vegetative | max(40, 65−5w)–max(45, 70−5w) | 22–28         | 17–24          |
//! | flowering  | 40–50                         | 20–26         | 20–26          |
//!
//! `w` is whole weeks since the vegetative (or cultivation) start.  The dark
//! band is the lit band lowered by 5 °C at the bottom and 4 °C at the top;
//! flowering keeps the lit band at night.

use serde::Serialize;

use crate::phase::GrowthPhase;

const DARK_MIN_OFFSET: f64 = 5.0;
const DARK_MAX_OFFSET: f64 = 4.0;

const VEG_HUM_MIN_START: f64 = 65.0;
const VEG_HUM_MAX_START: f64 = 70.0;
const VEG_HUM_MIN_FLOOR: f64 = 40.0;
const VEG_HUM_MAX_FLOOR: f64 = 45.0;
const VEG_HUM_STEP_PER_WEEK: f64 = 5.0;

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn mid(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    fn lowered(self, by_min: f64, by_max: f64) -> Self {
        Self::new(self.min - by_min, self.max - by_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Targets {
    pub temperature: Band,
    pub humidity: Band,
}

/// Targets for `phase`; `None` when no phase is set.
pub fn resolve(phase: Option<GrowthPhase>, weeks_elapsed: u32, light_on: bool) -> Option<Targets> {
    let phase = phase?;
    let (lit, humidity, dims_at_night) = match phase {
        GrowthPhase::Seedling => (Band::new(20.0, 25.0), Band::new(65.0, 70.0), true),
        GrowthPhase::Vegetative => (Band::new(22.0, 28.0), vegetative_humidity(weeks_elapsed), true),
        GrowthPhase::Flowering => (Band::new(20.0, 26.0), Band::new(40.0, 50.0), false),
    };

    let temperature = if light_on || !dims_at_night {
        lit
    } else {
        lit.lowered(DARK_MIN_OFFSET, DARK_MAX_OFFSET)
    };

    Some(Targets {
        temperature,
        humidity,
    })
}

/// Humidity steps down 5 % per week, clamped at 40–45 %.
fn vegetative_humidity(weeks: u32) -> Band {
    let drop = VEG_HUM_STEP_PER_WEEK * f64::from(weeks);
    Band::new(
        (VEG_HUM_MIN_START - drop).max(VEG_HUM_MIN_FLOOR),
        (VEG_HUM_MAX_START - drop).max(VEG_HUM_MAX_FLOOR),
    )
}
