//! Light duty-cycle scheduler: keeps the grow light on for `H` hours in every
//! 24 h cycle anchored at local midnight.
//!
//! The scheduler is tick-driven.  Each tick it reconciles its belief about
//! the light with the ground truth carried by the reading (if any), adds the
//! lit time since the previous tick to the day's counter, and decides
//! whether to switch.
//!
//! ```text
//! Uninitialized ──[first tick]──▶ On ──[hours_on >= H]──▶ Off
//!                                  ▲                        │
//!                                  └─[dark time >= 24 - H]──┘
//!                                  ▲
//!            any state ──[24 h since cycle start: new cycle]
//! ```
//!
//! The decision and the bookkeeping are split: [`LightSchedule::evaluate`]
//! returns the command to send and [`LightSchedule::record_toggle`] commits
//! it once the actuator confirmed.  A failed command leaves the schedule as
//! it was and the next tick decides again; that includes the switch-on that
//! opens the first cycle and every rollover.

use time::{Duration, OffsetDateTime, Time};

pub const DEFAULT_LIGHT_HOURS: f64 = 18.0;

const CYCLE_HOURS: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightState {
    pub is_on: bool,
    pub last_toggle: OffsetDateTime,
    /// Midnight that opened the current 24 h window.
    pub cycle_start: OffsetDateTime,
    /// Lit hours accumulated in the current window, within `0..=24`.
    pub hours_on_today: f64,
    pub last_state_check: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightSchedule {
    /// No tick seen yet.  `anchor` pins the cycle start chosen by a
    /// cultivation reset; otherwise the first tick's midnight is used.
    Uninitialized { anchor: Option<OffsetDateTime> },
    Running(LightState),
}

impl Default for LightSchedule {
    fn default() -> Self {
        Self::Uninitialized { anchor: None }
    }
}

impl LightSchedule {
    /// Fresh schedule for a new cultivation: light considered off, cycle
    /// anchored at today's midnight.  The next tick switches the light on.
    pub fn reset(now: OffsetDateTime) -> Self {
        Self::Uninitialized {
            anchor: Some(midnight(now)),
        }
    }

    pub fn state(&self) -> Option<&LightState> {
        match self {
            Self::Running(s) => Some(s),
            Self::Uninitialized { .. } => None,
        }
    }

    /// What the scheduler believes the light is doing, if it has a belief.
    pub fn belief(&self) -> Option<bool> {
        self.state().map(|s| s.is_on)
    }

    /// Advance the schedule to `now`.  Returns `Some(on)` when the light must
    /// be switched.
    pub fn evaluate(
        &mut self,
        now: OffsetDateTime,
        reported: Option<bool>,
        light_hours: f64,
    ) -> Option<bool> {
        let Self::Running(state) = self else {
            return Some(true);
        };

        // New cycle: always starts lit.  The counter is reset on commit.
        if now - state.cycle_start >= Duration::DAY {
            return Some(true);
        }

        let current_on = resolve_light_state(reported, Some(state.is_on));

        if state.is_on {
            let lit = if current_on {
                hours(now - state.last_state_check)
            } else {
                // Switched off between ticks at an unknown time: count only
                // up to the last toggle we know of.
                hours(state.last_toggle - state.last_state_check)
            };
            state.hours_on_today = (state.hours_on_today + lit.max(0.0)).clamp(0.0, CYCLE_HOURS);
        }
        state.last_state_check = now;
        if current_on != state.is_on {
            state.is_on = current_on;
            state.last_toggle = now;
        }

        if current_on && state.hours_on_today >= light_hours {
            return Some(false);
        }
        let dark_hours = hours(now - state.cycle_start) - state.hours_on_today;
        if !current_on && dark_hours >= CYCLE_HOURS - light_hours {
            return Some(true);
        }
        None
    }

    /// Commit a switch the actuator confirmed.  Opens the first cycle, or a
    /// new one when the current window is over.
    pub fn record_toggle(&mut self, on: bool, now: OffsetDateTime) {
        match self {
            Self::Uninitialized { anchor } => {
                let cycle_start = anchor.unwrap_or_else(|| midnight(now));
                *self = Self::Running(LightState {
                    is_on: on,
                    last_toggle: now,
                    cycle_start,
                    hours_on_today: 0.0,
                    last_state_check: now,
                });
            }
            Self::Running(state) => {
                if on && now - state.cycle_start >= Duration::DAY {
                    state.cycle_start = midnight(now);
                    state.hours_on_today = 0.0;
                    state.last_state_check = now;
                }
                state.is_on = on;
                state.last_toggle = now;
            }
        }
    }
}

/// Light state with defined precedence: ground truth from the reading, then
/// the remembered state, then off.
pub fn resolve_light_state(reported: Option<bool>, remembered: Option<bool>) -> bool {
    reported.or(remembered).unwrap_or(false)
}

pub fn midnight(ts: OffsetDateTime) -> OffsetDateTime {
    ts.replace_time(Time::MIDNIGHT)
}

fn hours(d: Duration) -> f64 {
    d.as_seconds_f64() / 3600.0
}
