mod proto;
mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use proto::{Command, Feedback, Settings};
use sim::{GardenSim, Scenario};

/// Simulated time advances in steps of this many seconds.
const TICK_S: u64 = 5;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

async fn publish_json<T: Serialize>(client: &AsyncClient, topic: &str, msg: &T) {
    let payload = match serde_json::to_vec(msg) {
        Ok(p) => p,
        Err(e) => {
            warn!(topic, "encode failed: {e}");
            return;
        }
    };
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!(topic, "publish error: {e}");
    }
}

async fn send_feedback(client: &AsyncClient, topic: &str, feedback: &Feedback) {
    debug!(topic, ?feedback, "feedback");
    publish_json(client, topic, feedback).await;
}

/// Publish feedback from its own task. Requests queue on the client's bounded
/// channel, which only drains while the event loop is polled.
fn spawn_feedback(client: &AsyncClient, topic: &str, feedback: Feedback) -> JoinHandle<()> {
    let client = client.clone();
    let topic = topic.to_string();
    tokio::spawn(async move { send_feedback(&client, &topic, &feedback).await })
}

/// Subscribe to the command topic, then announce config and status so the hub
/// creates this device's records. Runs off the polling task.
fn on_connected(
    client: &AsyncClient,
    commands: &str,
    feedback: &str,
    garden: &Mutex<GardenSim>,
) -> JoinHandle<()> {
    let (config, status) = {
        let g = garden.lock().unwrap_or_else(|p| p.into_inner());
        (g.config(), g.status())
    };
    let client = client.clone();
    let commands = commands.to_string();
    let feedback = feedback.to_string();
    tokio::spawn(async move {
        if let Err(e) = client.subscribe(&commands, QoS::AtLeastOnce).await {
            warn!("subscribe failed: {e}");
        }
        send_feedback(&client, &feedback, &config).await;
        send_feedback(&client, &feedback, &status).await;
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "SmartGarden-82FA".to_string());
    let sensor_every_s: u64 = env_or("SENSOR_EVERY_S", 300).max(TICK_S);
    let valves: usize = env_or("VALVES", 5);
    let sensors: usize = env_or("SENSORS", 5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let garden = Arc::new(Mutex::new(GardenSim::new(
        scenario,
        valves,
        sensors,
        Settings::factory(&device_id, &broker, port),
    )));

    let mut mqttoptions = MqttOptions::new(device_id.clone(), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let commands = proto::commands_topic(&device_id);
    let feedback = proto::feedback_topic(&device_id);
    let sensor_data = proto::sensor_data_topic(&device_id);
    info!(%device_id, %scenario, valves, sensors, "simulated garden ready");

    // Connection + command handling
    {
        let client = client.clone();
        let garden = Arc::clone(&garden);
        let feedback = feedback.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("node connected to mqtt");
                        on_connected(&client, &commands, &feedback, &garden);
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == commands => {
                        let command: Command = match serde_json::from_slice(&p.payload) {
                            Ok(c) => c,
                            Err(e) => {
                                warn!("ignoring command: {e}");
                                continue;
                            }
                        };
                        info!(?command, "command received");
                        let reply = garden
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .handle(command);
                        if let Some(reply) = reply {
                            spawn_feedback(&client, &feedback, reply);
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
    }

    info!(topic = %sensor_data, every_s = sensor_every_s, "publishing sensor data");

    let mut ticker = interval(Duration::from_secs(TICK_S));
    let mut since_report = sensor_every_s;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let data = {
                    let mut g = garden.lock().unwrap_or_else(|p| p.into_inner());
                    g.tick(TICK_S);
                    since_report += TICK_S;
                    (since_report >= sensor_every_s).then(|| g.sensor_data())
                };
                if let Some(data) = data {
                    since_report = 0;
                    publish_json(&client, &sensor_data, &data).await;
                    debug!(moisture = ?data.moisture, "sensor data published");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                client.disconnect().await.ok();
                break;
            }
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
