mod calibration;
mod config;
mod connection;
mod db;
mod history;
mod mqtt;
mod pipeline;
mod plants;
mod reading;
mod state;
mod web;

use anyhow::Result;
use std::env;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use connection::ConnectionManager;
use db::Db;
use history::HistoryStore;
use mqtt::MqttTransport;
use state::MonitorState;

/// Buffer between the connection manager and the pipeline.
const TELEMETRY_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "monitor.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.storage.db_url).await?;
    db.migrate().await?;

    let store = HistoryStore::new(db.clone());
    let history = store.load_or_seed(OffsetDateTime::now_utc()).await?;
    let calibration = db.load_calibration().await?;
    let plant = db.load_plant().await?;

    info!(
        history = history.len(),
        plant = plant.name,
        calibration = calibration.name(),
        "state restored"
    );

    // ── Shared state (ephemeral, for the status api) ────────────────
    let mut st = MonitorState::new(history, calibration, plant);
    st.record_system("monitor started".to_string());
    let shared = st.shared();

    // ── Connection manager + pipeline ───────────────────────────────
    let (events_tx, events_rx) = mpsc::channel(TELEMETRY_QUEUE);
    let (manager, connection) =
        ConnectionManager::new(MqttTransport::default(), cfg.manager_config(), events_tx);
    let manager_task = tokio::spawn(manager.run());
    let pipeline_task = tokio::spawn(pipeline::run(events_rx, shared.clone(), store));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared,
        db,
        connection: connection.clone(),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("status api stopped: {e:#}");
        }
    });

    connection.connect();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    connection.disconnect().await;
    manager_task.abort();
    let _ = manager_task.await;
    if let Err(e) = pipeline_task.await {
        error!("pipeline task failed: {e}");
    }
    Ok(())
}
