use crate::phase::GrowthPhase;
use crate::ports::Actuator;
use crate::reading::SensorReading;

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

pub(crate) const READING_FILTER: &str = "tele/+/reading";
/// Phase, cultivation and manual actuator commands:
/// `growbox/<sensor>/{phase,cultivation,<actuator_key>}/set`.
pub(crate) const COMMAND_FILTER: &str = "growbox/+/+/set";

/// What an incoming publish is about, keyed by sensor name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound<'a> {
    Reading(&'a str),
    PhaseSet(&'a str),
    CultivationSet(&'a str),
    ActuatorSet(&'a str, Actuator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CultivationCommand {
    Start,
    End,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn classify(topic: &str) -> Option<Inbound<'_>> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["tele", sensor, "reading"] if !sensor.is_empty() => Some(Inbound::Reading(*sensor)),
        ["growbox", sensor, "phase", "set"] if !sensor.is_empty() => {
            Some(Inbound::PhaseSet(*sensor))
        }
        ["growbox", sensor, "cultivation", "set"] if !sensor.is_empty() => {
            Some(Inbound::CultivationSet(*sensor))
        }
        ["growbox", sensor, key, "set"] if !sensor.is_empty() => {
            Actuator::from_key(key).map(|a| Inbound::ActuatorSet(*sensor, a))
        }
        _ => None,
    }
}

/// "actuator/<sensor_name>/<key>/set"
pub(crate) fn actuator_topic(sensor_name: &str, actuator: Actuator) -> String {
    format!("actuator/{sensor_name}/{}/set", actuator.key())
}

pub(crate) fn parse_reading(payload: &[u8]) -> Result<SensorReading, serde_json::Error> {
    serde_json::from_slice(payload)
}

pub(crate) fn parse_phase_command(payload: &[u8]) -> Result<GrowthPhase, String> {
    String::from_utf8_lossy(payload).parse()
}

/// Parse a "start"/"end" payload (case-insensitive, trims whitespace).
pub(crate) fn parse_cultivation_command(payload: &[u8]) -> Result<CultivationCommand, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "start" => Ok(CultivationCommand::Start),
        "end" => Ok(CultivationCommand::End),
        _ => Err(format!("unknown cultivation command '{s}'")),
    }
}

/// Parse an "ON"/"OFF" payload (case-insensitive, trims whitespace).
pub(crate) fn parse_switch_command(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown actuator command '{s}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
