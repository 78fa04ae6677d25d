mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};

use sim::{Frame, GrowBoxSim, Scenario};

#[derive(Debug, Serialize)]
struct ActuatorStates {
    luce_led: bool,
}

/// Telemetry payload understood by the hub.
#[derive(Debug, Serialize)]
struct ReadingMsg {
    ts: i64,
    temperature_1: Option<f64>,
    temperature_2: Option<f64>,
    temperature_3: Option<f64>,
    temperature_4: Option<f64>,
    humidity_1: Option<f64>,
    humidity_2: Option<f64>,
    humidity_3: Option<f64>,
    humidity_4: Option<f64>,
    actuator_states: ActuatorStates,
}

impl ReadingMsg {
    fn new(ts: i64, frame: Frame, light_on: bool) -> Self {
        let [temperature_1, temperature_2, temperature_3, temperature_4] = frame.temperatures;
        let [humidity_1, humidity_2, humidity_3, humidity_4] = frame.humidities;
        Self {
            ts,
            temperature_1,
            temperature_2,
            temperature_3,
            temperature_4,
            humidity_1,
            humidity_2,
            humidity_3,
            humidity_4,
            actuator_states: ActuatorStates { luce_led: light_on },
        }
    }
}

/// Extract the actuator key from "actuator/<node_id>/<key>/set".
fn extract_actuator_key<'a>(topic: &'a str, node_id: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["actuator", node, key, "set"] if *node == node_id && !key.is_empty() => Some(*key),
        _ => None,
    }
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
fn parse_switch_command(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown actuator command '{s}'")),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("growbox_node=info".parse()?),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_parse("MQTT_PORT").unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "growbox-1".to_string());
    let sample_every_s: u64 = env_parse("SAMPLE_EVERY_S").unwrap_or(60);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let sim = Arc::new(Mutex::new(GrowBoxSim::new(scenario)));
    info!(node = %node_id, %scenario, "simulator ready");

    let mut mqttoptions = MqttOptions::new(format!("growbox-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Actuator commands from the hub are applied to the simulated climate.
    let command_filter = format!("actuator/{node_id}/+/set");
    let loop_client = client.clone();
    let loop_sim = Arc::clone(&sim);
    let loop_node = node_id.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = loop_client.subscribe(&command_filter, QoS::AtLeastOnce).await {
                        warn!("subscribe {command_filter} failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let Some(key) = extract_actuator_key(&p.topic, &loop_node) else {
                        continue;
                    };
                    match parse_switch_command(&p.payload) {
                        Ok(on) => {
                            let mut s = loop_sim.lock().unwrap_or_else(|e| e.into_inner());
                            if s.set_actuator(key, on) {
                                info!(actuator = key, on, "actuator set");
                            } else {
                                warn!("unknown actuator '{key}'");
                            }
                        }
                        Err(msg) => warn!("{msg} (use ON/OFF)"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{node_id}/reading");
    info!("publishing to topic: {topic}");

    loop {
        let msg = {
            let mut s = sim.lock().unwrap_or_else(|e| e.into_inner());
            s.step();
            ReadingMsg::new(
                OffsetDateTime::now_utc().unix_timestamp(),
                s.sample(),
                s.actuators().light,
            )
        };

        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("publish error: {e}");
        } else {
            info!(ts = msg.ts, "published reading");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
