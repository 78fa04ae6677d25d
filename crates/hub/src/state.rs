use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::controller::{CommandOutcome, TickOutcome};
use crate::db::GrowboxRecord;
use crate::phase::GrowthPhase;
use crate::ports::Actuator;
use crate::reading::Averages;
use crate::targets::Targets;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub boxes: BTreeMap<String, BoxStatus>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Default, Serialize)]
pub struct BoxStatus {
    pub phase: Option<GrowthPhase>,
    pub cultivation_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub averages: Option<Averages>,
    pub weeks_elapsed: u32,
    pub targets: Option<Targets>,
    pub light_on: Option<bool>,
    /// Last successfully commanded state per actuator.
    pub actuators: BTreeMap<Actuator, bool>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Phase,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub boxes: BTreeMap<String, BoxStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            boxes: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Seed a box from its persisted record, actuator mirror and newest
    /// stored averages.
    pub fn register_box(
        &mut self,
        record: &GrowboxRecord,
        actuators: HashMap<Actuator, bool>,
        averages: Option<Averages>,
    ) {
        let status = self.boxes.entry(record.sensor_name.clone()).or_default();
        status.phase = record.phase;
        status.averages = averages;
        status.cultivation_active = record.cycle.active;
        status.light_on = actuators.get(&Actuator::Light).copied();
        status.actuators = actuators.into_iter().collect();
    }

    /// Record the result of one automation tick.  A disabled tick from a
    /// sensor that is not tracked yet leaves no trace, so stray publishers
    /// cannot grow the box map.
    pub fn record_tick(&mut self, sensor_name: &str, outcome: &TickOutcome, now: OffsetDateTime) {
        if matches!(outcome, TickOutcome::Disabled) && !self.boxes.contains_key(sensor_name) {
            return;
        }
        let status = self.boxes.entry(sensor_name.to_string()).or_default();
        status.last_seen = Some(now);

        let report = match outcome {
            TickOutcome::Disabled => {
                status.phase = None;
                status.targets = None;
                self.push_event(
                    EventKind::Reading,
                    format!("{sensor_name}: no growth phase, automation disabled"),
                );
                return;
            }
            TickOutcome::Ran(report) => report,
        };

        status.phase = Some(report.phase);
        status.averages = Some(report.averages);
        status.weeks_elapsed = report.weeks_elapsed;
        status.targets = Some(report.targets);
        status.light_on = Some(report.light_on);
        apply_commands(status, &report.commands);

        let detail = format!(
            "{sensor_name}: temp={} hum={} light={} ({})",
            fmt_value(report.averages.temperature),
            fmt_value(report.averages.humidity),
            if report.light_on { "on" } else { "off" },
            report.phase,
        );
        self.push_event(EventKind::Reading, detail);
        self.push_commands(sensor_name, &report.commands);
    }

    /// Record an explicit phase change.
    pub fn record_phase(&mut self, sensor_name: &str, phase: GrowthPhase) {
        self.boxes.entry(sensor_name.to_string()).or_default().phase = Some(phase);
        self.push_event(EventKind::Phase, format!("{sensor_name} set {phase}"));
    }

    pub fn record_cultivation_started(&mut self, sensor_name: &str) {
        let status = self.boxes.entry(sensor_name.to_string()).or_default();
        status.phase = Some(GrowthPhase::Seedling);
        status.cultivation_active = true;
        status.weeks_elapsed = 0;
        status.targets = None;
        self.push_event(EventKind::Phase, format!("{sensor_name} cultivation started"));
    }

    pub fn record_cultivation_ended(&mut self, sensor_name: &str, commands: &[CommandOutcome]) {
        let status = self.boxes.entry(sensor_name.to_string()).or_default();
        *status = BoxStatus {
            last_seen: status.last_seen,
            averages: status.averages,
            ..BoxStatus::default()
        };
        apply_commands(status, commands);
        if status.actuators.contains_key(&Actuator::Light) {
            status.light_on = Some(false);
        }
        self.push_event(EventKind::Phase, format!("{sensor_name} cultivation ended"));
        self.push_commands(sensor_name, commands);
    }

    /// Record an operator command for a single actuator.
    pub fn record_manual(&mut self, sensor_name: &str, outcome: &CommandOutcome) {
        let commands = std::slice::from_ref(outcome);
        let status = self.boxes.entry(sensor_name.to_string()).or_default();
        apply_commands(status, commands);
        if outcome.result.is_ok() && outcome.action.actuator == Actuator::Light {
            status.light_on = Some(outcome.action.on);
        }
        self.push_commands(sensor_name, commands);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            boxes: self.boxes.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_commands(&mut self, sensor_name: &str, commands: &[CommandOutcome]) {
        for c in commands {
            match &c.result {
                Ok(()) => self.push_event(EventKind::Actuator, format!("{sensor_name} {}", c.action)),
                Err(e) => self.push_event(EventKind::Error, format!("{sensor_name}: {e}")),
            }
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_commands(status: &mut BoxStatus, commands: &[CommandOutcome]) {
    for c in commands.iter().filter(|c| c.result.is_ok()) {
        status.actuators.insert(c.action.actuator, c.action.on);
    }
}

fn fmt_value(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::TickReport;
    use crate::error::ControlError;
    use crate::phase::CultivationCycle;
    use crate::ports::ActuatorAction;
    use crate::targets::Band;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn report(commands: Vec<CommandOutcome>) -> TickOutcome {
        TickOutcome::Ran(TickReport {
            phase: GrowthPhase::Seedling,
            averages: Averages {
                temperature: Some(18.26),
                humidity: None,
            },
            weeks_elapsed: 0,
            light_on: true,
            targets: Targets {
                temperature: Band::new(20.0, 25.0),
                humidity: Band::new(65.0, 70.0),
            },
            commands,
        })
    }

    fn ok(action: ActuatorAction) -> CommandOutcome {
        CommandOutcome {
            action,
            result: Ok(()),
        }
    }

    fn failed(action: ActuatorAction) -> CommandOutcome {
        CommandOutcome {
            action,
            result: Err(ControlError::ActuatorFailure {
                action,
                reason: "broker down".into(),
            }),
        }
    }

    #[test]
    fn tick_updates_box_and_logs_commands() {
        let mut st = SystemState::new();
        let outcome = report(vec![
            ok(ActuatorAction::on(Actuator::Light)),
            failed(ActuatorAction::on(Actuator::Heater)),
        ]);
        st.record_tick("box-a", &outcome, NOW);

        let b = &st.boxes["box-a"];
        assert_eq!(b.phase, Some(GrowthPhase::Seedling));
        assert_eq!(b.last_seen, Some(NOW));
        assert_eq!(b.light_on, Some(true));
        assert_eq!(b.actuators.get(&Actuator::Light), Some(&true));
        assert_eq!(b.actuators.get(&Actuator::Heater), None);

        let kinds: Vec<EventKind> = st.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Reading, EventKind::Actuator, EventKind::Error]
        );
        assert_eq!(st.events[0].detail, "box-a: temp=18.3 hum=n/a light=on (piantina)");
        assert_eq!(st.events[1].detail, "box-a light_on");
    }

    #[test]
    fn disabled_tick_clears_targets() {
        let mut st = SystemState::new();
        st.record_tick("box-a", &report(vec![]), NOW);
        st.record_tick("box-a", &TickOutcome::Disabled, NOW);

        let b = &st.boxes["box-a"];
        assert_eq!(b.phase, None);
        assert!(b.targets.is_none());
        assert!(st.events[1].detail.contains("automation disabled"));
    }

    #[test]
    fn disabled_tick_from_unknown_sensor_is_ignored() {
        let mut st = SystemState::new();
        for i in 0..50 {
            st.record_tick(&format!("stray-{i}"), &TickOutcome::Disabled, NOW);
        }
        assert!(st.boxes.is_empty());
        assert!(st.events.is_empty());

        // A sensor that actually runs automation is tracked.
        st.record_tick("box-a", &report(vec![]), NOW);
        assert_eq!(st.boxes.len(), 1);
    }

    #[test]
    fn manual_command_updates_actuators() {
        let mut st = SystemState::new();
        st.record_manual("box-a", &ok(ActuatorAction::off(Actuator::Light)));
        st.record_manual("box-a", &failed(ActuatorAction::on(Actuator::Fan)));

        let b = &st.boxes["box-a"];
        assert_eq!(b.light_on, Some(false));
        assert_eq!(b.actuators.get(&Actuator::Light), Some(&false));
        assert_eq!(b.actuators.get(&Actuator::Fan), None);
        let kinds: Vec<EventKind> = st.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Actuator, EventKind::Error]);
    }

    #[test]
    fn register_box_seeds_from_store() {
        let mut st = SystemState::new();
        let record = GrowboxRecord {
            sensor_name: "box-a".into(),
            phase: Some(GrowthPhase::Flowering),
            cycle: CultivationCycle {
                active: true,
                ..CultivationCycle::default()
            },
        };
        let averages = Averages {
            temperature: Some(24.0),
            humidity: Some(45.0),
        };
        st.register_box(
            &record,
            HashMap::from([(Actuator::Light, true)]),
            Some(averages),
        );

        let b = &st.boxes["box-a"];
        assert_eq!(b.phase, Some(GrowthPhase::Flowering));
        assert!(b.cultivation_active);
        assert_eq!(b.light_on, Some(true));
        assert_eq!(b.averages, Some(averages));
    }

    #[test]
    fn cultivation_lifecycle() {
        let mut st = SystemState::new();
        st.record_cultivation_started("box-a");
        assert!(st.boxes["box-a"].cultivation_active);
        st.record_tick("box-a", &report(vec![ok(ActuatorAction::on(Actuator::Light))]), NOW);

        let shutdown: Vec<CommandOutcome> = Actuator::ALL
            .into_iter()
            .map(|a| ok(ActuatorAction::off(a)))
            .collect();
        st.record_cultivation_ended("box-a", &shutdown);

        let b = &st.boxes["box-a"];
        assert!(!b.cultivation_active);
        assert_eq!(b.phase, None);
        assert_eq!(b.last_seen, Some(NOW));
        assert_eq!(b.light_on, Some(false));
        assert!(b.actuators.values().all(|on| !on));
        assert_eq!(b.actuators.len(), 5);
    }

    #[test]
    fn event_ring_is_bounded_and_newest_first() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);

        let status = st.to_status();
        assert_eq!(status.events.len(), MAX_EVENTS);
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 24));
        assert_eq!(status.events[MAX_EVENTS - 1].detail, "event 25");
    }

    #[test]
    fn status_serialises() {
        let mut st = SystemState::new();
        st.record_tick("box-a", &report(vec![ok(ActuatorAction::on(Actuator::Light))]), NOW);
        st.record_phase("box-a", GrowthPhase::Vegetative);

        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["boxes"]["box-a"]["phase"], "vegetativa");
        assert_eq!(json["boxes"]["box-a"]["actuators"]["luce_led"], true);
        assert_eq!(json["boxes"]["box-a"]["last_seen"], "2024-06-01T12:00:00Z");
        assert_eq!(json["events"][0]["kind"], "phase");
    }
}
