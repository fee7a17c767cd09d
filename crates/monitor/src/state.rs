use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::calibration::{is_sensor_error, Orientation, SensorCalibration};
use crate::connection::ConnectionState;
use crate::history::History;
use crate::plants::{PlantSummary, PlantThreshold, WaterStatus};
use crate::reading::SoilReading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<MonitorState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct MonitorState {
    pub started_at: Instant,
    pub history: History,
    pub calibration: SensorCalibration,
    pub plant: &'static PlantThreshold,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Connection,
    Error,
    System,
}

/// A reading as presented: the node's own percentage next to the one
/// derived from the active calibration, classified for the active plant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingView {
    pub raw: i64,
    pub reported_percent: i64,
    pub calibrated_percent: i64,
    pub state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: WaterStatus,
    pub status_label: &'static str,
    pub needs_water: bool,
    pub sensor_error: bool,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub connected: bool,
    pub connection: ConnectionState,
    pub latest: Option<ReadingView>,
    pub plant: PlantSummary,
    pub calibration: SensorCalibration,
    pub orientation: Orientation,
    /// Raw reading at which the selected plant starts to need water.
    pub water_needed_raw: i64,
    pub history_len: usize,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl MonitorState {
    pub fn new(
        history: History,
        calibration: SensorCalibration,
        plant: &'static PlantThreshold,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            history,
            calibration,
            plant,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Append a reading to the history and log it.
    pub fn record_reading(&mut self, reading: SoilReading) {
        let percent = self.calibration.raw_to_percent(reading.raw);
        let detail = format!(
            "raw={} reported={}% calibrated={}% state={}",
            reading.raw, reading.percent, percent, reading.state
        );
        if is_sensor_error(reading.raw) {
            self.push_event(
                EventKind::Error,
                format!("raw={} is at an ADC rail; check the sensor", reading.raw),
            );
        }
        self.history.append(reading);
        self.push_event(EventKind::Reading, detail);
    }

    /// Log a connectivity change. The current connection state itself is
    /// owned by the connection manager and passed to [`to_status`](Self::to_status).
    pub fn record_connection(&mut self, connected: bool) {
        let detail = if connected { "broker connected" } else { "broker disconnected" };
        self.push_event(EventKind::Connection, detail.to_string());
    }

    pub fn set_calibration(&mut self, calibration: SensorCalibration) {
        self.push_event(
            EventKind::System,
            format!(
                "calibration set to {} (wet={} dry={})",
                calibration.name(),
                calibration.wet_value(),
                calibration.dry_value()
            ),
        );
        self.calibration = calibration;
    }

    pub fn select_plant(&mut self, plant: &'static PlantThreshold) {
        self.plant = plant;
        self.push_event(EventKind::System, format!("plant set to {}", plant.name));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn view(&self, reading: &SoilReading) -> ReadingView {
        let calibrated = self.calibration.raw_to_percent(reading.raw);
        let status = self.plant.status(calibrated);
        ReadingView {
            raw: reading.raw,
            reported_percent: reading.percent,
            calibrated_percent: calibrated,
            state: reading.state.clone(),
            timestamp: reading.timestamp,
            status,
            status_label: status.label(),
            needs_water: status.needs_water(),
            sensor_error: is_sensor_error(reading.raw),
        }
    }

    pub fn latest(&self) -> Option<ReadingView> {
        self.history.latest().map(|r| self.view(r))
    }

    /// Oldest first.
    pub fn history_views(&self) -> Vec<ReadingView> {
        self.history.readings().map(|r| self.view(r)).collect()
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, connection: ConnectionState) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected: connection == ConnectionState::Connected,
            connection,
            latest: self.latest(),
            plant: self.plant.summary(),
            calibration: self.calibration.clone(),
            orientation: self.calibration.orientation(),
            water_needed_raw: self
                .calibration
                .percent_to_raw(self.plant.water_needed_threshold()),
            history_len: self.history.len(),
            events: self.events.iter().rev().cloned().collect(),
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

// ===========================================================================
// Tests
// ===========================================================================
