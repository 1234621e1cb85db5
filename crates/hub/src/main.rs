mod clock;
mod command;
mod config;
mod db;
mod dispatch;
mod error;
mod ingest;
mod mqtt;
mod publish;
mod reconcile;
mod staleness;
mod state;
mod store;
mod web;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use rumqttc::{Event, Packet, Publish};
use std::{env, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use db::Db;
use dispatch::Dispatcher;
use mqtt::MqttLink;
use publish::CommandPublisher;
use staleness::StatusService;
use state::{HubState, SharedState};
use store::StateStore;

/// Route one inbound publish on its own task.
fn on_publish(dispatcher: &Dispatcher, publish: Publish) -> JoinHandle<()> {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.route(&publish.topic, &publish.payload).await;
    })
}

/// Handle a ConnAck. The subscribe requests share the client's bounded
/// channel, which only drains while the event loop is polled, so they are
/// sent from a separate task and never awaited by the polling loop.
async fn on_connected(link: &MqttLink, health: &SharedState) -> JoinHandle<()> {
    health.write().await.set_connected(true);
    let link = link.clone();
    tokio::spawn(async move {
        match link.subscribe().await {
            Ok(()) => info!(
                "subscribed to {} and {}",
                mqtt::FEEDBACK_FILTER,
                mqtt::SENSOR_DATA_FILTER
            ),
            Err(e) => error!("subscribe failed: {e}"),
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "garden-hub.toml".to_string());
    let settings = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.database.url, settings.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", settings.database.url))?;
    db.migrate().await?;
    info!(url = %settings.database.url, "db ready");

    let store: Arc<dyn StateStore> = Arc::new(db);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── Shared state (ephemeral, for diagnostics) ───────────────────
    let health = HubState::shared();
    health.write().await.record_system("hub started".to_string());

    // ── MQTT link + core services ───────────────────────────────────
    let (link, mut eventloop) = MqttLink::connect(&settings.mqtt);
    let publisher = CommandPublisher::new(Arc::new(link.clone()), store.clone(), clock.clone())
        .with_health(health.clone());
    let dispatcher = Dispatcher::new(store.clone(), clock.clone(), health.clone());
    let status = StatusService::new(
        store.clone(),
        clock.clone(),
        publisher.clone(),
        settings.sync.stale_after_secs,
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        status,
        publisher,
        health: health.clone(),
        history_limit: settings.sync.history_limit,
    };
    let web_settings = settings.web.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, &web_settings).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    let stopper = link.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; disconnecting");
            if let Err(e) = stopper.stop().await {
                warn!("mqtt disconnect failed: {e}");
            }
        }
    });

    info!(
        host = %settings.mqtt.host,
        port = settings.mqtt.port,
        client_id = %settings.mqtt.client_id,
        "connecting to broker"
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                on_publish(&dispatcher, p);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                on_connected(&link, &health).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected by broker");
                health.write().await.set_connected(false);
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                info!("mqtt link stopped");
                health.write().await.set_connected(false);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");

                let mut st = health.write().await;
                st.set_connected(false);
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
