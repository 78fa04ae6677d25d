//! Actuator port adapters.
//!
//! - [`MqttActuator`] publishes `ON`/`OFF` to `actuator/<sensor>/<key>/set`
//!   for boxes whose relays sit on a remote node.  Publishing never waits:
//!   a full client queue is reported as a failed command.
//! - [`RelayBoard`] drives relays wired to this host's GPIO header.  The
//!   `gpio` feature gates the real rppal driver; without it a mock board
//!   keeps the relay states in memory and logs every change.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::error::ControlError;
use crate::mqtt::actuator_topic;
use crate::ports::{Actuator, ActuatorAction, ActuatorPort};

/// `(sensor_name, actuator, BCM pin)` for every wired relay.
pub type RelayMap = Vec<(String, Actuator, u8)>;

type RelayKey = (String, Actuator);

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

pub struct MqttActuator {
    client: AsyncClient,
}

impl MqttActuator {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActuatorPort for MqttActuator {
    async fn execute(&self, sensor_name: &str, action: ActuatorAction) -> Result<(), ControlError> {
        let topic = actuator_topic(sensor_name, action.actuator);
        let payload = if action.on { "ON" } else { "OFF" };
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| ControlError::ActuatorFailure {
                action,
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: Mutex<HashMap<RelayKey, OutputPin>>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(relays: &[(String, Actuator, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (sensor_name, actuator, pin_num) in relays {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: every relay starts released.
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            info!(sensor = %sensor_name, %actuator, pin = pin_num, "relay registered");
            pins.insert((sensor_name.clone(), *actuator), pin);
        }

        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }

    pub fn set(&self, sensor_name: &str, actuator: Actuator, on: bool) -> Result<(), String> {
        let mut pins = lock(&self.pins)?;
        let pin = pins
            .get_mut(&(sensor_name.to_string(), actuator))
            .ok_or_else(|| format!("no relay wired for {sensor_name}/{actuator}"))?;
        // Active-low boards close the relay on LOW.
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(sensor = %sensor_name, %actuator, on, "relay set");
        Ok(())
    }

    pub fn all_off(&self) {
        let keys: Vec<RelayKey> = match lock(&self.pins) {
            Ok(pins) => pins.keys().cloned().collect(),
            Err(e) => {
                warn!("relay board unavailable: {e}");
                return;
            }
        };
        for (sensor_name, actuator) in keys {
            if let Err(e) = self.set(&sensor_name, actuator, false) {
                warn!("{e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    relays: Mutex<HashMap<RelayKey, bool>>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(relays: &[(String, Actuator, u8)], _active_low: bool) -> Result<Self> {
        let mut states = HashMap::new();
        for (sensor_name, actuator, pin_num) in relays {
            info!(sensor = %sensor_name, %actuator, pin = pin_num, "[mock-gpio] relay registered (not wired)");
            states.insert((sensor_name.clone(), *actuator), false);
        }
        info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            relays: Mutex::new(states),
        })
    }

    pub fn set(&self, sensor_name: &str, actuator: Actuator, on: bool) -> Result<(), String> {
        let mut relays = lock(&self.relays)?;
        let state = relays
            .get_mut(&(sensor_name.to_string(), actuator))
            .ok_or_else(|| format!("no relay wired for {sensor_name}/{actuator}"))?;
        *state = on;
        info!(sensor = %sensor_name, %actuator, on, "[mock-gpio] relay set");
        Ok(())
    }

    pub fn all_off(&self) {
        match lock(&self.relays) {
            Ok(mut relays) => relays.values_mut().for_each(|on| *on = false),
            Err(e) => warn!("relay board unavailable: {e}"),
        }
    }

    /// Current relay state; `None` for an unwired relay.
    #[cfg(test)]
    pub fn is_on(&self, sensor_name: &str, actuator: Actuator) -> Option<bool> {
        lock(&self.relays)
            .ok()?
            .get(&(sensor_name.to_string(), actuator))
            .copied()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, String> {
    m.lock().map_err(|_| "relay board lock poisoned".to_string())
}

#[async_trait]
impl ActuatorPort for RelayBoard {
    async fn execute(&self, sensor_name: &str, action: ActuatorAction) -> Result<(), ControlError> {
        self.set(sensor_name, action.actuator, action.on)
            .map_err(|reason| ControlError::ActuatorFailure { action, reason })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
