//! TOML config file loading, validation, and store seeding for grow boxes.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use time::UtcOffset;

use crate::actuator::RelayMap;
use crate::db::Db;
use crate::light::DEFAULT_LIGHT_HOURS;
use crate::ports::Actuator;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub boxes: Vec<BoxEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ControllerSection {
    /// Offset of local time from UTC; light cycles start at local midnight.
    #[serde(default)]
    pub utc_offset_hours: i64,
    #[serde(default)]
    pub actuator_backend: ActuatorBackend,
    #[serde(default = "default_light_hours")]
    pub default_light_hours: f64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            utc_offset_hours: 0,
            actuator_backend: ActuatorBackend::default(),
            default_light_hours: DEFAULT_LIGHT_HOURS,
        }
    }
}

fn default_light_hours() -> f64 {
    DEFAULT_LIGHT_HOURS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorBackend {
    /// Commands published to the box's node over MQTT.
    #[default]
    Mqtt,
    /// Relays wired to this host's GPIO header.
    Relay,
}

#[derive(Debug, Deserialize)]
pub struct BoxEntry {
    pub sensor_name: String,
    #[serde(default)]
    pub light_hours: Option<f64>,
    #[serde(default)]
    pub relays: Option<RelayPins>,
}

/// BCM pin per actuator, named like the persisted actuator keys.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayPins {
    pub luce_led: i64,
    pub ventola: i64,
    pub resistenza: i64,
    pub pompa_aspirazione: i64,
    pub pompa_acqua: i64,
}

impl RelayPins {
    pub fn pins(&self) -> [(Actuator, i64); 5] {
        [
            (Actuator::Light, self.luce_led),
            (Actuator::Fan, self.ventola),
            (Actuator::Heater, self.resistenza),
            (Actuator::ExtractionPump, self.pompa_aspirazione),
            (Actuator::WaterPump, self.pompa_acqua),
        ]
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Real-world UTC offsets, in whole hours.
const UTC_OFFSET_RANGE: std::ops::RangeInclusive<i64> = -12..=14;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_boxes(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if !UTC_OFFSET_RANGE.contains(&c.utc_offset_hours) {
            errors.push(format!(
                "controller: utc_offset_hours {} out of range [-12, 14]",
                c.utc_offset_hours
            ));
        }
        if !valid_light_hours(c.default_light_hours) {
            errors.push(format!(
                "controller: default_light_hours {} out of range (0, 24]",
                c.default_light_hours
            ));
        }
    }

    fn validate_boxes(&self, errors: &mut Vec<String>) {
        let relay_backend = self.controller.actuator_backend == ActuatorBackend::Relay;
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashMap<i64, String> = HashMap::new();

        for (i, b) in self.boxes.iter().enumerate() {
            let ctx = || {
                if b.sensor_name.is_empty() {
                    format!("boxes[{i}]")
                } else {
                    format!("box '{}'", b.sensor_name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if b.sensor_name.trim().is_empty() {
                errors.push(format!("{}: sensor_name is empty", ctx()));
            } else if b.sensor_name.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{}: sensor_name must not contain MQTT topic characters",
                    ctx()
                ));
            } else if !seen_names.insert(&b.sensor_name) {
                errors.push(format!("{}: duplicate sensor_name", ctx()));
            }

            // ── Photoperiod ─────────────────────────────────────
            if let Some(h) = b.light_hours {
                if !valid_light_hours(h) {
                    errors.push(format!("{}: light_hours {h} out of range (0, 24]", ctx()));
                }
            }

            // ── Relays ──────────────────────────────────────────
            let Some(relays) = &b.relays else {
                if relay_backend {
                    errors.push(format!(
                        "{}: relays table is required with actuator_backend = \"relay\"",
                        ctx()
                    ));
                }
                continue;
            };
            for (actuator, pin) in relays.pins() {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: {actuator} pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx()
                    ));
                } else if let Some(owner) = seen_pins.get(&pin) {
                    errors.push(format!(
                        "{}: {actuator} pin {pin} is already used by {owner}",
                        ctx()
                    ));
                } else {
                    seen_pins.insert(pin, format!("{}/{actuator}", ctx()));
                }
            }
        }
    }

    pub fn utc_offset(&self) -> UtcOffset {
        i8::try_from(self.controller.utc_offset_hours)
            .ok()
            .and_then(|h| UtcOffset::from_hms(h, 0, 0).ok())
            .unwrap_or(UtcOffset::UTC)
    }

    /// `(sensor_name, light_hours)` for every box that overrides the default.
    pub fn light_hours(&self) -> impl Iterator<Item = (&str, f64)> {
        self.boxes
            .iter()
            .filter_map(|b| b.light_hours.map(|h| (b.sensor_name.as_str(), h)))
    }

    /// Relay wiring for the relay backend.  Only meaningful after
    /// [`validate`](Self::validate) accepted the pins.
    pub fn relay_map(&self) -> RelayMap {
        self.boxes
            .iter()
            .filter_map(|b| b.relays.as_ref().map(|r| (b, r)))
            .flat_map(|(b, r)| {
                r.pins().into_iter().filter_map(move |(actuator, pin)| {
                    u8::try_from(pin)
                        .ok()
                        .map(|pin| (b.sensor_name.clone(), actuator, pin))
                })
            })
            .collect()
    }
}

fn valid_light_hours(h: f64) -> bool {
    h > 0.0 && h <= 24.0
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Register every configured box in the store. Existing phases and
/// cultivation calendars are left untouched.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for b in &config.boxes {
        db.register_box(&b.sensor_name)
            .await
            .with_context(|| format!("failed to register box '{}'", b.sensor_name))?;
    }

    tracing::info!(
        boxes = config.boxes.len(),
        backend = ?config.controller.actuator_backend,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
