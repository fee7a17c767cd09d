//! Glue between the connection manager and everything downstream of it.
//!
//! Each event is applied to [`MonitorState`](crate::state::MonitorState)
//! first, so readers see a new reading before it is durable. History
//! snapshots then go to one writer task which persists them in order,
//! skipping straight to the newest snapshot when several queue up.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::calibration::SensorCalibration;
use crate::connection::TelemetryEvent;
use crate::db::Db;
use crate::history::{History, HistoryStore};
use crate::plants::PlantThreshold;
use crate::state::SharedState;

const PERSIST_QUEUE: usize = 16;

/// Consume telemetry until the connection manager goes away, then flush
/// outstanding history writes.
pub async fn run(mut events: mpsc::Receiver<TelemetryEvent>, shared: SharedState, store: HistoryStore) {
    let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE);
    let writer = tokio::spawn(persist_loop(persist_rx, store, shared.clone()));

    while let Some(event) = events.recv().await {
        match event {
            TelemetryEvent::DataReceived(reading) => {
                debug!(raw = reading.raw, percent = reading.percent, state = %reading.state, "reading");
                let snapshot = {
                    let mut st = shared.write().await;
                    st.record_reading(reading);
                    st.history.clone()
                };
                if persist_tx.send(snapshot).await.is_err() {
                    error!("history writer stopped; readings are no longer persisted");
                }
            }
            TelemetryEvent::ConnectionChanged(connected) => {
                info!(connected, "connectivity changed");
                shared.write().await.record_connection(connected);
            }
        }
    }

    drop(persist_tx);
    if let Err(e) = writer.await {
        error!("history writer panicked: {e}");
    }
    info!("telemetry pipeline stopped");
}

async fn persist_loop(mut rx: mpsc::Receiver<History>, store: HistoryStore, shared: SharedState) {
    while let Some(mut snapshot) = rx.recv().await {
        // Only the newest queued snapshot matters.
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }
        if let Err(e) = store.save(&snapshot).await {
            error!("persist history failed: {e:#}");
            shared
                .write()
                .await
                .record_error(format!("persist history failed: {e:#}"));
        }
    }
}

// ---------------------------------------------------------------------------
// Settings changes
// ---------------------------------------------------------------------------

/// Switch the active plant profile and remember the choice.
pub async fn select_plant(shared: &SharedState, db: &Db, plant: &'static PlantThreshold) -> Result<()> {
    db.save_selected_plant(plant.name)
        .await
        .context("save selected plant")?;
    shared.write().await.select_plant(plant);
    info!(plant = plant.name, "plant selected");
    Ok(())
}

/// Replace the active calibration and remember it.
pub async fn set_calibration(shared: &SharedState, db: &Db, calibration: SensorCalibration) -> Result<()> {
    db.save_calibration(&calibration)
        .await
        .context("save calibration")?;
    info!(
        name = calibration.name(),
        wet = calibration.wet_value(),
        dry = calibration.dry_value(),
        "calibration updated"
    );
    shared.write().await.set_calibration(calibration);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
