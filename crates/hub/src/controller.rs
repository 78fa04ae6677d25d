//! Phase controller: turns each sensor reading into actuator commands.
//!
//! Per tick, in order: aggregate probes, age the vegetative targets, resolve
//! the target bands for the current light state, run the temperature and
//! humidity hysteresis controllers, then the light scheduler.  Each
//! confirmed command is mirrored to the config store.
//!
//! Per-sensor control state lives in this struct and nowhere else; its
//! lifecycle follows start/end cultivation.  Ticks for the same sensor must
//! be serialised by the caller (`&mut self` already enforces it for a single
//! owner).  Failures never abort a tick: a failed sub-step is logged,
//! reported in the [`TickReport`] and skipped.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::hysteresis::{Hysteresis, Quantity};
use crate::light::{resolve_light_state, LightSchedule, DEFAULT_LIGHT_HOURS};
use crate::phase::GrowthPhase;
use crate::ports::{Actuator, ActuatorAction, ActuatorPort, ConfigStore};
use crate::reading::{Averages, SensorReading};
use crate::targets::{self, Targets};

// ---------------------------------------------------------------------------
// Per-sensor state and tick results
// ---------------------------------------------------------------------------

/// In-process control state of one grow box.
#[derive(Debug, Clone, Default)]
pub struct BoxState {
    /// Last phase the store confirmed; stands in for it during an outage.
    pub phase: Option<GrowthPhase>,
    pub light: LightSchedule,
    pub temperature: Hysteresis,
    pub humidity: Hysteresis,
    /// Last confirmed command per actuator.  Best effort: the store is the
    /// durable copy and the reading's ground truth wins for the light.
    pub actuators: HashMap<Actuator, bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub action: ActuatorAction,
    pub result: Result<(), ControlError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub phase: GrowthPhase,
    pub averages: Averages,
    pub weeks_elapsed: u32,
    /// Light state the targets were resolved for.
    pub light_on: bool,
    pub targets: Targets,
    pub commands: Vec<CommandOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No phase set: automation disabled, nothing commanded.
    Disabled,
    Ran(TickReport),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct GrowController {
    actuators: Arc<dyn ActuatorPort>,
    store: Arc<dyn ConfigStore>,
    default_light_hours: f64,
    light_hours: HashMap<String, f64>,
    boxes: HashMap<String, BoxState>,
}

impl GrowController {
    pub fn new(actuators: Arc<dyn ActuatorPort>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            actuators,
            store,
            default_light_hours: DEFAULT_LIGHT_HOURS,
            light_hours: HashMap::new(),
            boxes: HashMap::new(),
        }
    }

    pub fn with_default_light_hours(mut self, hours: f64) -> Self {
        self.default_light_hours = hours;
        self
    }

    pub fn with_light_hours(mut self, sensor_name: &str, hours: f64) -> Self {
        self.light_hours.insert(sensor_name.to_string(), hours);
        self
    }

    pub fn light_hours(&self, sensor_name: &str) -> f64 {
        self.light_hours
            .get(sensor_name)
            .copied()
            .unwrap_or(self.default_light_hours)
    }

    pub fn box_state(&self, sensor_name: &str) -> Option<&BoxState> {
        self.boxes.get(sensor_name)
    }

    /// Read the phase from the store, then run [`on_reading`](Self::on_reading).
    /// While the store is unreachable the last phase it returned is used;
    /// a box never seen before stays disabled.
    pub async fn tick(
        &mut self,
        sensor_name: &str,
        reading: &SensorReading,
        now: OffsetDateTime,
    ) -> TickOutcome {
        let phase = match self.store.get_phase(sensor_name).await {
            Ok(p) => p,
            Err(e) => {
                let last = self.boxes.get(sensor_name).and_then(|s| s.phase);
                warn!(sensor = %sensor_name, last_phase = ?last, "phase lookup failed, using last known phase: {e}");
                last
            }
        };
        self.on_reading(sensor_name, reading, phase, now).await
    }

    /// One automation tick for `sensor_name`.
    pub async fn on_reading(
        &mut self,
        sensor_name: &str,
        reading: &SensorReading,
        phase: Option<GrowthPhase>,
        now: OffsetDateTime,
    ) -> TickOutcome {
        let Some(phase) = phase else {
            debug!(sensor = %sensor_name, "no growth phase set, automation disabled");
            return TickOutcome::Disabled;
        };

        let mut state = self.boxes.remove(sensor_name).unwrap_or_default();
        state.phase = Some(phase);

        let averages = reading.averages();
        let weeks_elapsed = self.weeks_elapsed(sensor_name, phase, now).await;

        let remembered = match state.light.belief() {
            Some(b) => Some(b),
            None => self.persisted(sensor_name, Actuator::Light).await,
        };
        let light_on = resolve_light_state(reading.reported_light(), remembered);

        // `phase` is set, so targets always resolve.
        let Some(targets) = targets::resolve(Some(phase), weeks_elapsed, light_on) else {
            self.boxes.insert(sensor_name.to_string(), state);
            return TickOutcome::Disabled;
        };

        info!(
            sensor = %sensor_name,
            %phase,
            avg_temp = ?averages.temperature.map(|t| format!("{t:.1}")),
            avg_hum = ?averages.humidity.map(|h| format!("{h:.1}")),
            weeks_elapsed,
            light_on,
            temp_band = format!("{:.0}-{:.0}", targets.temperature.min, targets.temperature.max),
            hum_band = format!("{:.0}-{:.0}", targets.humidity.min, targets.humidity.max),
            "automation tick"
        );

        let mut commands = Vec::new();

        let decision = state
            .temperature
            .step(averages.temperature, targets.temperature);
        for action in decision.actions(Quantity::Temperature) {
            commands.push(self.command(sensor_name, &mut state, action).await);
        }

        let decision = state.humidity.step(averages.humidity, targets.humidity);
        for action in decision.actions(Quantity::Humidity) {
            commands.push(self.command(sensor_name, &mut state, action).await);
        }

        let light_hours = self.light_hours(sensor_name);
        if let Some(on) = state
            .light
            .evaluate(now, reading.reported_light(), light_hours)
        {
            let action = if on {
                ActuatorAction::on(Actuator::Light)
            } else {
                ActuatorAction::off(Actuator::Light)
            };
            let outcome = self.command(sensor_name, &mut state, action).await;
            if outcome.result.is_ok() {
                state.light.record_toggle(on, now);
            }
            commands.push(outcome);
        }

        self.boxes.insert(sensor_name.to_string(), state);

        TickOutcome::Ran(TickReport {
            phase,
            averages,
            weeks_elapsed,
            light_on,
            targets,
            commands,
        })
    }

    // -----------------------------------------------------------------------
    // Explicit phase transitions
    // -----------------------------------------------------------------------

    pub async fn set_phase(
        &mut self,
        sensor_name: &str,
        phase: GrowthPhase,
        now: OffsetDateTime,
    ) -> Result<(), ControlError> {
        self.store.set_phase(sensor_name, phase, now).await?;
        if let Some(state) = self.boxes.get_mut(sensor_name) {
            state.phase = Some(phase);
        }
        info!(sensor = %sensor_name, %phase, "growth phase set");
        Ok(())
    }

    /// Seedling phase, fresh calendar, and a fresh control state whose light
    /// schedule is anchored at today's midnight.
    pub async fn start_cultivation(
        &mut self,
        sensor_name: &str,
        now: OffsetDateTime,
    ) -> Result<(), ControlError> {
        self.store.start_cultivation(sensor_name, now).await?;
        self.boxes.insert(
            sensor_name.to_string(),
            BoxState {
                phase: Some(GrowthPhase::Seedling),
                light: LightSchedule::reset(now),
                ..BoxState::default()
            },
        );
        info!(sensor = %sensor_name, "cultivation started");
        Ok(())
    }

    /// Clear persisted and in-process state, then switch every actuator off.
    /// Shutdown failures are logged and returned, never escalated.
    pub async fn end_cultivation(&mut self, sensor_name: &str) -> Vec<CommandOutcome> {
        if let Err(e) = self.store.end_cultivation(sensor_name).await {
            warn!(sensor = %sensor_name, "end_cultivation: store not cleared: {e}");
        }
        self.boxes.remove(sensor_name);

        let mut outcomes = Vec::with_capacity(Actuator::ALL.len());
        for actuator in Actuator::ALL {
            let action = ActuatorAction::off(actuator);
            let result = self.actuators.execute(sensor_name, action).await;
            if let Err(e) = &result {
                warn!(sensor = %sensor_name, %action, "shutdown command failed: {e}");
            }
            outcomes.push(CommandOutcome { action, result });
        }
        info!(sensor = %sensor_name, "cultivation ended");
        outcomes
    }

    /// Operator command for a single actuator, outside the automation.
    /// Goes through the same path as automatic commands, so a confirmed
    /// command is cached and mirrored.  A manual light switch is adopted by
    /// the scheduler as the new belief.
    pub async fn command_manual(
        &mut self,
        sensor_name: &str,
        action: ActuatorAction,
        now: OffsetDateTime,
    ) -> CommandOutcome {
        let mut state = self.boxes.remove(sensor_name).unwrap_or_default();
        let outcome = self.command(sensor_name, &mut state, action).await;
        if outcome.result.is_ok() && action.actuator == Actuator::Light {
            if let LightSchedule::Running(_) = state.light {
                state.light.record_toggle(action.on, now);
            }
        }
        info!(sensor = %sensor_name, %action, ok = outcome.result.is_ok(), "manual command");
        self.boxes.insert(sensor_name.to_string(), state);
        outcome
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Execute one command; on success update the cache and mirror it to
    /// the store (mirror failures are logged and skipped).
    async fn command(
        &self,
        sensor_name: &str,
        state: &mut BoxState,
        action: ActuatorAction,
    ) -> CommandOutcome {
        let result = self.actuators.execute(sensor_name, action).await;
        match &result {
            Ok(()) => {
                info!(sensor = %sensor_name, %action, "actuator command sent");
                state.actuators.insert(action.actuator, action.on);
                if let Err(e) = self
                    .store
                    .set_actuator_state(sensor_name, action.actuator, action.on)
                    .await
                {
                    warn!(sensor = %sensor_name, %action, "actuator state not persisted: {e}");
                }
            }
            Err(e) => warn!(sensor = %sensor_name, %action, "{e}"),
        }
        CommandOutcome { action, result }
    }

    async fn weeks_elapsed(&self, sensor_name: &str, phase: GrowthPhase, now: OffsetDateTime) -> u32 {
        if phase != GrowthPhase::Vegetative {
            return 0;
        }
        match self.store.get_cultivation(sensor_name).await {
            Ok(cycle) => cycle.weeks_elapsed(now),
            Err(e) => {
                warn!(sensor = %sensor_name, "cultivation lookup failed, assuming week 0: {e}");
                0
            }
        }
    }

    async fn persisted(&self, sensor_name: &str, actuator: Actuator) -> Option<bool> {
        match self.store.get_actuator_state(sensor_name, actuator).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(sensor = %sensor_name, %actuator, "last known state unavailable: {e}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::format_timestamp;
    use crate::ports::testing::{MemoryStore, RecordingActuator, StoredBox};
    use crate::reading::ReportedStates;
    use crate::targets::Band;
    use time::macros::datetime;
    use time::Duration;

    const BOX: &str = "growbox-1";
    const NOW: OffsetDateTime = datetime!(2024-06-01 10:00 UTC);

    fn harness() -> (GrowController, Arc<RecordingActuator>, Arc<MemoryStore>) {
        let actuators = Arc::new(RecordingActuator::default());
        let store = Arc::new(MemoryStore::default());
        let ctl = GrowController::new(actuators.clone(), store.clone());
        (ctl, actuators, store)
    }

    fn reading(temp: f64, hum: f64, light: Option<bool>) -> SensorReading {
        SensorReading {
            temperature_1: Some(temp),
            temperature_2: Some(temp),
            temperature_3: Some(temp),
            temperature_4: Some(temp),
            humidity_1: Some(hum),
            humidity_2: Some(hum),
            humidity_3: Some(hum),
            humidity_4: Some(hum),
            actuator_states: light.map(|l| ReportedStates { light: Some(l) }),
            ..Default::default()
        }
    }

    fn report(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Ran(r) => r,
            TickOutcome::Disabled => panic!("expected the tick to run"),
        }
    }

    fn heater_on() -> ActuatorAction {
        ActuatorAction::on(Actuator::Heater)
    }

    // -- Phase gating ---------------------------------------------------------

    #[tokio::test]
    async fn no_phase_does_nothing() {
        let (mut ctl, act, _store) = harness();
        let out = ctl.on_reading(BOX, &reading(10.0, 20.0, None), None, NOW).await;
        assert_eq!(out, TickOutcome::Disabled);
        assert!(act.actions().is_empty());
        assert!(ctl.box_state(BOX).is_none());
    }

    #[tokio::test]
    async fn tick_reads_phase_from_store() {
        let (mut ctl, act, store) = harness();
        assert_eq!(
            ctl.tick(BOX, &reading(22.0, 67.0, None), NOW).await,
            TickOutcome::Disabled
        );

        store.set_phase(BOX, GrowthPhase::Seedling, NOW).await.unwrap();
        let r = report(ctl.tick(BOX, &reading(22.0, 67.0, None), NOW).await);
        assert_eq!(r.phase, GrowthPhase::Seedling);
        assert!(!act.actions().is_empty());
    }

    // -- Scenarios ------------------------------------------------------------

    #[tokio::test]
    async fn seedling_cold_with_light_on_starts_heater() {
        let (mut ctl, act, _store) = harness();
        let r = report(
            ctl.on_reading(BOX, &reading(14.0, 67.0, Some(true)), Some(GrowthPhase::Seedling), NOW)
                .await,
        );
        assert!(r.light_on);
        assert_eq!(r.targets.temperature, Band::new(20.0, 25.0));
        assert!(act.actions().contains(&heater_on()));
        assert!(ctl.box_state(BOX).unwrap().temperature.latched_low());
    }

    #[tokio::test]
    async fn seedling_in_dark_band_leaves_heater_off() {
        let (mut ctl, act, _store) = harness();
        let r = report(
            ctl.on_reading(BOX, &reading(17.0, 67.0, Some(false)), Some(GrowthPhase::Seedling), NOW)
                .await,
        );
        assert!(!r.light_on);
        assert_eq!(r.targets.temperature, Band::new(15.0, 21.0));
        assert!(!act.actions().contains(&heater_on()));
        assert!(act.actions().contains(&ActuatorAction::off(Actuator::Heater)));
    }

    #[tokio::test]
    async fn seedling_cold_in_dark_still_heats() {
        let (mut ctl, act, _store) = harness();
        ctl.on_reading(BOX, &reading(14.0, 67.0, Some(false)), Some(GrowthPhase::Seedling), NOW)
            .await;
        assert!(act.actions().contains(&heater_on()));
    }

    #[tokio::test]
    async fn vegetative_targets_age_with_cultivation() {
        let (mut ctl, _act, store) = harness();
        store.put(
            BOX,
            StoredBox {
                phase: Some(GrowthPhase::Vegetative),
                cycle: crate::phase::CultivationCycle {
                    active: true,
                    cultivation_start: Some(format_timestamp(NOW - Duration::weeks(6))),
                    vegetative_start: Some(format_timestamp(NOW - Duration::days(22))),
                    flowering_start: None,
                },
                ..Default::default()
            },
        );

        let r = report(ctl.tick(BOX, &reading(25.0, 52.0, Some(true)), NOW).await);
        assert_eq!(r.weeks_elapsed, 3);
        assert_eq!(r.targets.humidity, Band::new(50.0, 55.0));
    }

    #[tokio::test]
    async fn humidity_high_engages_fan_and_stops_extraction() {
        let (mut ctl, act, _store) = harness();
        ctl.on_reading(BOX, &reading(22.0, 80.0, Some(true)), Some(GrowthPhase::Seedling), NOW)
            .await;
        let actions = act.actions();
        assert!(actions.contains(&ActuatorAction::off(Actuator::WaterPump)));
        assert!(actions.contains(&ActuatorAction::on(Actuator::Fan)));
        assert!(actions.contains(&ActuatorAction::off(Actuator::ExtractionPump)));
    }

    #[tokio::test]
    async fn missing_probes_skip_controllers_but_not_light() {
        let (mut ctl, act, _store) = harness();
        let r = report(
            ctl.on_reading(BOX, &SensorReading::default(), Some(GrowthPhase::Flowering), NOW)
                .await,
        );
        assert_eq!(r.averages, Averages::default());
        assert_eq!(act.actions(), vec![ActuatorAction::on(Actuator::Light)]);
    }

    // -- Hysteresis through the controller -------------------------------------

    #[tokio::test]
    async fn heater_commanded_once_per_latch_period() {
        let (mut ctl, act, _store) = harness();
        let phase = Some(GrowthPhase::Seedling);
        // Lit band 20–25, mid 22.5.
        for (i, t) in [18.0, 21.0, 21.5, 22.0, 22.4].iter().enumerate() {
            let now = NOW + Duration::minutes(5 * i as i64);
            ctl.on_reading(BOX, &reading(*t, 67.0, Some(true)), phase, now).await;
        }
        let heater: Vec<_> = act
            .actions()
            .into_iter()
            .filter(|a| a.actuator == Actuator::Heater)
            .collect();
        assert_eq!(heater, vec![heater_on()]);

        act.clear();
        ctl.on_reading(BOX, &reading(22.6, 67.0, Some(true)), phase, NOW + Duration::minutes(30))
            .await;
        assert!(act.actions().contains(&ActuatorAction::off(Actuator::Heater)));
        assert!(!ctl.box_state(BOX).unwrap().temperature.latched_low());
    }

    // -- Persistence mirror and failure isolation ------------------------------

    #[tokio::test]
    async fn confirmed_commands_are_mirrored() {
        let (mut ctl, _act, store) = harness();
        ctl.on_reading(BOX, &reading(14.0, 67.0, Some(true)), Some(GrowthPhase::Seedling), NOW)
            .await;

        let stored = store.snapshot(BOX);
        assert_eq!(stored.actuators.get(&Actuator::Heater), Some(&true));
        assert_eq!(stored.actuators.get(&Actuator::Light), Some(&true));
        assert_eq!(stored.actuators.get(&Actuator::WaterPump), Some(&false));

        let cache = &ctl.box_state(BOX).unwrap().actuators;
        assert_eq!(cache.get(&Actuator::Heater), Some(&true));
    }

    #[tokio::test]
    async fn failed_command_does_not_abort_tick() {
        let (mut ctl, act, store) = harness();
        act.fail_on(heater_on());

        let r = report(
            ctl.on_reading(BOX, &reading(14.0, 80.0, None), Some(GrowthPhase::Seedling), NOW)
                .await,
        );

        let failed: Vec<_> = r.commands.iter().filter(|c| c.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0].result,
            Err(ControlError::ActuatorFailure { .. })
        ));
        // Humidity and light still ran.
        assert!(act.actions().contains(&ActuatorAction::on(Actuator::Fan)));
        assert!(act.actions().contains(&ActuatorAction::on(Actuator::Light)));
        // The failed command is not mirrored.
        assert_eq!(store.snapshot(BOX).actuators.get(&Actuator::Heater), None);
    }

    #[tokio::test]
    async fn failed_light_command_is_retried_next_tick() {
        let (mut ctl, act, _store) = harness();
        act.fail_on(ActuatorAction::on(Actuator::Light));
        let phase = Some(GrowthPhase::Flowering);

        ctl.on_reading(BOX, &reading(22.0, 45.0, None), phase, NOW).await;
        assert_eq!(ctl.box_state(BOX).unwrap().light.belief(), None);
        assert!(!ctl.box_state(BOX).unwrap().actuators.contains_key(&Actuator::Light));

        ctl.on_reading(BOX, &reading(22.0, 45.0, None), phase, NOW + Duration::hours(1))
            .await;
        let light_ons = act
            .actions()
            .into_iter()
            .filter(|a| *a == ActuatorAction::on(Actuator::Light))
            .count();
        assert_eq!(light_ons, 2);
    }

    #[tokio::test]
    async fn store_outage_degrades_to_defaults() {
        let (mut ctl, act, store) = harness();
        store.set_unavailable(true);

        let r = report(
            ctl.on_reading(BOX, &reading(23.0, 70.0, None), Some(GrowthPhase::Vegetative), NOW)
                .await,
        );
        assert_eq!(r.weeks_elapsed, 0);
        assert!(!r.light_on);
        assert_eq!(r.targets.humidity, Band::new(65.0, 70.0));
        assert!(r.commands.iter().all(|c| c.result.is_ok()));
        assert!(act.actions().contains(&ActuatorAction::on(Actuator::Light)));
    }

    #[tokio::test]
    async fn store_outage_mid_cultivation_keeps_controlling() {
        let (mut ctl, act, store) = harness();
        store.set_phase(BOX, GrowthPhase::Seedling, NOW).await.unwrap();
        report(ctl.tick(BOX, &reading(22.0, 67.0, Some(true)), NOW).await);

        store.set_unavailable(true);
        act.clear();
        let r = report(
            ctl.tick(BOX, &reading(10.0, 67.0, Some(true)), NOW + Duration::minutes(5))
                .await,
        );
        assert_eq!(r.phase, GrowthPhase::Seedling);
        assert!(act.actions().contains(&heater_on()));
    }

    #[tokio::test]
    async fn store_outage_on_unknown_box_stays_disabled() {
        let (mut ctl, act, store) = harness();
        store.set_unavailable(true);
        assert_eq!(
            ctl.tick(BOX, &reading(10.0, 67.0, None), NOW).await,
            TickOutcome::Disabled
        );
        assert!(act.actions().is_empty());
    }

    #[tokio::test]
    async fn persisted_light_state_used_before_first_schedule_tick() {
        let (mut ctl, _act, store) = harness();
        store.set_actuator_state(BOX, Actuator::Light, true).await.unwrap();

        let r = report(
            ctl.on_reading(BOX, &reading(22.0, 67.0, None), Some(GrowthPhase::Seedling), NOW)
                .await,
        );
        assert!(r.light_on);
        assert_eq!(r.targets.temperature, Band::new(20.0, 25.0));
    }

    #[tokio::test]
    async fn ground_truth_beats_schedule_memory() {
        let (mut ctl, _act, _store) = harness();
        let phase = Some(GrowthPhase::Seedling);
        ctl.on_reading(BOX, &reading(22.0, 67.0, None), phase, NOW).await;
        assert_eq!(ctl.box_state(BOX).unwrap().light.belief(), Some(true));

        let r = report(
            ctl.on_reading(BOX, &reading(22.0, 67.0, Some(false)), phase, NOW + Duration::hours(1))
                .await,
        );
        assert!(!r.light_on);
        assert_eq!(r.targets.temperature, Band::new(15.0, 21.0));
    }

    #[tokio::test]
    async fn light_hours_per_box() {
        let (ctl, _act, _store) = harness();
        let ctl = ctl
            .with_default_light_hours(16.0)
            .with_light_hours("growbox-2", 12.0);
        assert_eq!(ctl.light_hours(BOX), 16.0);
        assert_eq!(ctl.light_hours("growbox-2"), 12.0);
    }

    // -- Cultivation lifecycle --------------------------------------------------

    #[tokio::test]
    async fn start_cultivation_resets_schedule_without_switching() {
        let (mut ctl, act, store) = harness();
        ctl.start_cultivation(BOX, NOW).await.unwrap();

        assert!(act.actions().is_empty());
        let stored = store.snapshot(BOX);
        assert_eq!(stored.phase, Some(GrowthPhase::Seedling));
        assert!(stored.cycle.active);
        assert_eq!(stored.cycle.cultivation_start, Some(format_timestamp(NOW)));

        let state = ctl.box_state(BOX).unwrap();
        assert_eq!(state.light, LightSchedule::reset(NOW));

        ctl.tick(BOX, &reading(22.0, 67.0, None), NOW + Duration::minutes(1))
            .await;
        assert!(act.actions().contains(&ActuatorAction::on(Actuator::Light)));
        let light = *ctl.box_state(BOX).unwrap().light.state().unwrap();
        assert_eq!(light.cycle_start, datetime!(2024-06-01 00:00 UTC));
    }

    #[tokio::test]
    async fn end_cultivation_clears_everything() {
        let (mut ctl, act, store) = harness();
        ctl.start_cultivation(BOX, NOW).await.unwrap();
        // Latch both raise actuators.
        ctl.tick(BOX, &reading(14.0, 50.0, Some(true)), NOW).await;
        let state = ctl.box_state(BOX).unwrap();
        assert!(state.temperature.latched_low());
        assert!(state.humidity.latched_low());

        act.clear();
        act.fail_on(ActuatorAction::off(Actuator::Fan));
        let outcomes = ctl.end_cultivation(BOX).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| !o.action.on));
        assert_eq!(outcomes.iter().filter(|o| o.result.is_err()).count(), 1);
        assert!(ctl.box_state(BOX).is_none());
        assert_eq!(store.snapshot(BOX).phase, None);

        // Re-enter: light uninitialised again, latches cleared.
        act.clear();
        ctl.on_reading(BOX, &reading(22.0, 67.0, None), Some(GrowthPhase::Seedling), NOW)
            .await;
        assert!(act.actions().contains(&ActuatorAction::on(Actuator::Light)));
        let state = ctl.box_state(BOX).unwrap();
        assert!(!state.temperature.latched_low());
        assert!(!state.humidity.latched_low());
    }

    #[tokio::test]
    async fn end_cultivation_survives_store_outage() {
        let (mut ctl, act, store) = harness();
        store.set_unavailable(true);
        let outcomes = ctl.end_cultivation(BOX).await;
        assert_eq!(outcomes.len(), 5);
        assert_eq!(act.actions().len(), 5);
    }

    #[tokio::test]
    async fn phase_change_survives_later_outage() {
        let (mut ctl, _act, store) = harness();
        ctl.start_cultivation(BOX, NOW).await.unwrap();
        ctl.set_phase(BOX, GrowthPhase::Flowering, NOW).await.unwrap();
        store.set_unavailable(true);

        let r = report(ctl.tick(BOX, &reading(22.0, 45.0, None), NOW).await);
        assert_eq!(r.phase, GrowthPhase::Flowering);
    }

    // -- Manual commands --------------------------------------------------------

    #[tokio::test]
    async fn manual_command_is_sent_and_mirrored() {
        let (mut ctl, act, store) = harness();
        let action = ActuatorAction::on(Actuator::WaterPump);
        let outcome = ctl.command_manual(BOX, action, NOW).await;

        assert_eq!(outcome.result, Ok(()));
        assert_eq!(act.actions(), vec![action]);
        assert_eq!(store.snapshot(BOX).actuators.get(&Actuator::WaterPump), Some(&true));
        assert_eq!(
            ctl.box_state(BOX).unwrap().actuators.get(&Actuator::WaterPump),
            Some(&true)
        );
    }

    #[tokio::test]
    async fn failed_manual_command_is_reported_not_mirrored() {
        let (mut ctl, act, store) = harness();
        let action = ActuatorAction::off(Actuator::Fan);
        act.fail_on(action);

        let outcome = ctl.command_manual(BOX, action, NOW).await;
        assert!(matches!(outcome.result, Err(ControlError::ActuatorFailure { .. })));
        assert_eq!(store.snapshot(BOX).actuators.get(&Actuator::Fan), None);
    }

    #[tokio::test]
    async fn manual_light_off_is_adopted_by_schedule() {
        let (mut ctl, _act, _store) = harness();
        let phase = Some(GrowthPhase::Seedling);
        ctl.on_reading(BOX, &reading(22.0, 67.0, None), phase, NOW).await;
        assert_eq!(ctl.box_state(BOX).unwrap().light.belief(), Some(true));

        ctl.command_manual(BOX, ActuatorAction::off(Actuator::Light), NOW + Duration::minutes(1))
            .await;
        assert_eq!(ctl.box_state(BOX).unwrap().light.belief(), Some(false));
    }

    #[tokio::test]
    async fn set_phase_stamps_vegetative_start() {
        let (mut ctl, _act, store) = harness();
        ctl.start_cultivation(BOX, NOW - Duration::weeks(2)).await.unwrap();
        ctl.set_phase(BOX, GrowthPhase::Vegetative, NOW).await.unwrap();

        let stored = store.snapshot(BOX);
        assert_eq!(stored.phase, Some(GrowthPhase::Vegetative));
        assert_eq!(stored.cycle.vegetative_start, Some(format_timestamp(NOW)));
    }

    #[tokio::test]
    async fn set_phase_propagates_store_failure() {
        let (mut ctl, _act, store) = harness();
        store.set_unavailable(true);
        assert!(matches!(
            ctl.set_phase(BOX, GrowthPhase::Flowering, NOW).await,
            Err(ControlError::StoreUnavailable(_))
        ));
    }
}
