mod actuator;
mod config;
mod controller;
mod db;
mod error;
mod hysteresis;
mod light;
mod mqtt;
mod phase;
mod ports;
mod reading;
mod state;
mod targets;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use actuator::{MqttActuator, RelayBoard};
use config::ActuatorBackend;
use controller::GrowController;
use db::Db;
use mqtt::{CultivationCommand, Inbound};
use ports::{ActuatorAction, ActuatorPort, ConfigStore};
use reading::Averages;
use state::{SharedState, SystemState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("growbox_hub=info".parse()?),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_parse("MQTT_PORT").unwrap_or(1883);
    let web_port: u16 = env_parse("WEB_PORT").unwrap_or(8080);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:growbox.db?mode=rwc".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed boxes) ────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let utc_offset = cfg.utc_offset();

    let boxes = db.load_growboxes().await?;
    if boxes.is_empty() {
        warn!("no grow boxes registered; readings from any sensor will still be handled");
    }

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
    {
        let mut st = shared.write().await;
        for record in &boxes {
            let actuators = db.load_actuator_states(&record.sensor_name).await?;
            let averages = db
                .latest_reading(&record.sensor_name)
                .await?
                .map(|(_, temperature, humidity)| Averages {
                    temperature,
                    humidity,
                });
            st.register_box(record, actuators, averages);
        }
        st.record_system(format!("hub started with {} box(es)", boxes.len()));
    }
    info!(boxes = boxes.len(), %utc_offset, "db ready");

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("growbox-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 64);

    // The event loop is polled on its own task; inbound publishes reach the
    // controller through a channel, so queued actuator commands keep
    // draining while a tick runs.
    let (tx, mut rx) = mpsc::channel::<Publish>(256);
    tokio::spawn(poll_mqtt(eventloop, client.clone(), tx, Arc::clone(&shared)));

    // ── Actuators + controller ──────────────────────────────────────
    let actuators: Arc<dyn ActuatorPort> = match cfg.controller.actuator_backend {
        ActuatorBackend::Mqtt => Arc::new(MqttActuator::new(client.clone())),
        ActuatorBackend::Relay => {
            let board = RelayBoard::new(&cfg.relay_map(), active_low)
                .context("failed to initialise relay board")?;
            board.all_off();
            Arc::new(board)
        }
    };
    let store: Arc<dyn ConfigStore> = Arc::new(db.clone());

    let mut controller = GrowController::new(actuators, store)
        .with_default_light_hours(cfg.controller.default_light_hours);
    for (sensor_name, hours) in cfg.light_hours() {
        controller = controller.with_light_hours(sensor_name, hours);
    }

    while let Some(p) = rx.recv().await {
        let now = OffsetDateTime::now_utc().to_offset(utc_offset);
        let topic = p.topic.as_str();
        let payload = &p.payload[..];

        match mqtt::classify(topic) {
            Some(Inbound::Reading(sensor)) => match mqtt::parse_reading(payload) {
                Ok(reading) => {
                    let avg = reading.averages();
                    let ts = reading.ts.unwrap_or_else(|| now.unix_timestamp());
                    // History is best-effort; the tick runs regardless.
                    if let Err(e) = db
                        .insert_reading(ts, sensor, avg.temperature, avg.humidity)
                        .await
                    {
                        warn!(sensor = %sensor, "insert_reading failed: {e:#}");
                    }

                    let outcome = controller.tick(sensor, &reading, now).await;
                    shared.write().await.record_tick(sensor, &outcome, now);
                }
                Err(e) => {
                    warn!(sensor = %sensor, "bad reading json: {e}");
                    shared
                        .write()
                        .await
                        .record_error(format!("{sensor}: bad reading json: {e}"));
                }
            },
            Some(Inbound::PhaseSet(sensor)) => match mqtt::parse_phase_command(payload) {
                Ok(phase) => match controller.set_phase(sensor, phase, now).await {
                    Ok(()) => shared.write().await.record_phase(sensor, phase),
                    Err(e) => {
                        warn!(sensor = %sensor, %phase, "set_phase failed: {e}");
                        shared.write().await.record_error(format!("{sensor}: {e}"));
                    }
                },
                Err(msg) => {
                    warn!(sensor = %sensor, "{msg}");
                    shared.write().await.record_error(format!("{sensor}: {msg}"));
                }
            },
            Some(Inbound::CultivationSet(sensor)) => {
                match mqtt::parse_cultivation_command(payload) {
                    Ok(CultivationCommand::Start) => {
                        match controller.start_cultivation(sensor, now).await {
                            Ok(()) => shared.write().await.record_cultivation_started(sensor),
                            Err(e) => {
                                warn!(sensor = %sensor, "start_cultivation failed: {e}");
                                shared.write().await.record_error(format!("{sensor}: {e}"));
                            }
                        }
                    }
                    Ok(CultivationCommand::End) => {
                        let outcomes = controller.end_cultivation(sensor).await;
                        shared
                            .write()
                            .await
                            .record_cultivation_ended(sensor, &outcomes);
                    }
                    Err(msg) => {
                        warn!(sensor = %sensor, "{msg} (use start/end)");
                        shared.write().await.record_error(format!("{sensor}: {msg}"));
                    }
                }
            }
            Some(Inbound::ActuatorSet(sensor, actuator)) => {
                match mqtt::parse_switch_command(payload) {
                    Ok(on) => {
                        let action = if on {
                            ActuatorAction::on(actuator)
                        } else {
                            ActuatorAction::off(actuator)
                        };
                        let outcome = controller.command_manual(sensor, action, now).await;
                        shared.write().await.record_manual(sensor, &outcome);
                    }
                    Err(msg) => {
                        warn!(sensor = %sensor, %actuator, "{msg} (use ON/OFF)");
                        shared.write().await.record_error(format!("{sensor}: {msg}"));
                    }
                }
            }
            None => debug!("unhandled topic={topic}"),
        }
    }

    anyhow::bail!("mqtt event loop stopped")
}

/// Drive the MQTT connection: renew subscriptions on every connect, keep the
/// status current, and hand inbound publishes to the control loop.
async fn poll_mqtt(
    mut eventloop: EventLoop,
    client: AsyncClient,
    tx: mpsc::Sender<Publish>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if tx.send(p).await.is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean session: subscriptions are renewed on every connect.
                for filter in [mqtt::READING_FILTER, mqtt::COMMAND_FILTER] {
                    if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
                        error!("subscribe {filter} failed: {e}");
                    }
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}
