use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::calibration::SensorCalibration;
use crate::connection::ConnectionHandle;
use crate::db::Db;
use crate::pipeline;
use crate::plants::{self, PlantSummary};
use crate::state::{ReadingView, SharedState};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub connection: ConnectionHandle,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/plants", get(api_plants))
        .route("/api/plant", put(api_select_plant))
        .route("/api/calibration", put(api_set_calibration))
        .route("/api/calibration/presets", get(api_presets))
        .route("/api/reconnect", post(api_reconnect))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let connection = state.connection.state();
    let st = state.shared.read().await;
    Json(st.to_status(connection))
}

async fn api_history(State(state): State<AppState>) -> Json<Vec<ReadingView>> {
    let st = state.shared.read().await;
    Json(st.history_views())
}

#[derive(Deserialize)]
struct PlantQuery {
    #[serde(default)]
    q: String,
}

async fn api_plants(Query(query): Query<PlantQuery>) -> Json<Vec<PlantSummary>> {
    Json(plants::search(&query.q).into_iter().map(|p| p.summary()).collect())
}

#[derive(Deserialize)]
struct SelectPlant {
    name: String,
}

async fn api_select_plant(
    State(state): State<AppState>,
    Json(body): Json<SelectPlant>,
) -> Response {
    let Some(plant) = plants::lookup(&body.name) else {
        return (StatusCode::NOT_FOUND, format!("unknown plant: {}", body.name)).into_response();
    };
    match pipeline::select_plant(&state.shared, &state.db, plant).await {
        Ok(()) => Json(plant.summary()).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetCalibration {
    wet_value: i64,
    dry_value: i64,
    #[serde(default)]
    name: String,
}

async fn api_set_calibration(
    State(state): State<AppState>,
    Json(body): Json<SetCalibration>,
) -> Response {
    let calibration = match SensorCalibration::new(body.wet_value, body.dry_value, body.name) {
        Ok(c) => c,
        Err(e) => return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
    };
    match pipeline::set_calibration(&state.shared, &state.db, calibration.clone()).await {
        Ok(()) => Json(calibration).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_presets() -> Json<Vec<SensorCalibration>> {
    Json(SensorCalibration::presets())
}

async fn api_reconnect(State(state): State<AppState>) -> StatusCode {
    state.connection.connect();
    StatusCode::ACCEPTED
}

fn internal_error(e: anyhow::Error) -> Response {
    error!("request failed: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{test_config, RecordingTransport};
    use crate::connection::{ConnectionManager, TelemetryEvent, TransportEvent};
    use crate::db::tests::memory_db;
    use crate::history::History;
    use crate::plants::default_plant;
    use crate::reading::SoilReading;
    use crate::state::MonitorState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        state: AppState,
        opened: mpsc::UnboundedReceiver<crate::connection::testing::OpenedSession>,
        events: mpsc::Receiver<TelemetryEvent>,
    }

    async fn fixture() -> Fixture {
        let db = memory_db().await;
        let shared =
            MonitorState::new(History::new(), SensorCalibration::default(), default_plant()).shared();
        let (transport, opened) = RecordingTransport::new();
        let (events_tx, events) = mpsc::channel(8);
        let (manager, connection) = ConnectionManager::new(transport, test_config(), events_tx);
        tokio::spawn(manager.run());

        let state = AppState {
            shared,
            db,
            connection,
        };
        Fixture {
            app: router(state.clone()),
            state,
            opened,
            events,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    // -- GET ----------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_latest_and_connection() {
        let f = fixture().await;
        f.state
            .shared
            .write()
            .await
            .record_reading(SoilReading::new(2350, 47, "ok", OffsetDateTime::now_utc()));

        let (status, json) = call(&f.app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connection"], "disconnected");
        assert_eq!(json["latest"]["raw"], 2350);
        assert_eq!(json["latest"]["reported_percent"], 47);
        assert_eq!(json["latest"]["calibrated_percent"], 50);
        assert_eq!(json["plant"]["name"], "Generic");
    }

    #[tokio::test]
    async fn history_is_oldest_first() {
        let f = fixture().await;
        let now = OffsetDateTime::now_utc();
        {
            let mut st = f.state.shared.write().await;
            st.record_reading(SoilReading::new(1, 0, "ok", now));
            st.record_reading(SoilReading::new(2, 0, "ok", now + time::Duration::minutes(1)));
        }
        let (status, json) = call(&f.app, "GET", "/api/history", None).await;
        assert_eq!(status, StatusCode::OK);
        let raws: Vec<i64> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["raw"].as_i64().unwrap())
            .collect();
        assert_eq!(raws, vec![1, 2]);
    }

    #[tokio::test]
    async fn plant_search_filters() {
        let f = fixture().await;
        let (_, json) = call(&f.app, "GET", "/api/plants?q=tom", None).await;
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Tomato"]);

        let (_, all) = call(&f.app, "GET", "/api/plants", None).await;
        assert_eq!(all.as_array().unwrap().len(), plants::PLANTS.len());
    }

    #[tokio::test]
    async fn presets_listed() {
        let f = fixture().await;
        let (_, json) = call(&f.app, "GET", "/api/calibration/presets", None).await;
        assert_eq!(json[0]["wetValue"], 1200);
    }

    // -- PUT ----------------------------------------------------------------

    #[tokio::test]
    async fn select_plant_persists() {
        let f = fixture().await;
        let (status, json) = call(&f.app, "PUT", "/api/plant", Some(r#"{"name":"tomato"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["water_needed_threshold"], 60);
        assert_eq!(f.state.db.load_selected_plant().await.unwrap(), "Tomato");
    }

    #[tokio::test]
    async fn select_unknown_plant_is_404() {
        let f = fixture().await;
        let (status, _) = call(&f.app, "PUT", "/api/plant", Some(r#"{"name":"Triffid"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(f.state.shared.read().await.plant.name, "Generic");
    }

    #[tokio::test]
    async fn set_calibration_persists() {
        let f = fixture().await;
        let (status, json) = call(
            &f.app,
            "PUT",
            "/api/calibration",
            Some(r#"{"wetValue":1400,"dryValue":3300,"name":"v2"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["dryValue"], 3300);
        assert_eq!(f.state.db.load_calibration().await.unwrap().wet_value(), 1400);
    }

    #[tokio::test]
    async fn zero_range_calibration_is_422() {
        let f = fixture().await;
        let (status, _) = call(
            &f.app,
            "PUT",
            "/api/calibration",
            Some(r#"{"wetValue":2000,"dryValue":2000}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(f.state.shared.read().await.calibration, SensorCalibration::default());
    }

    #[tokio::test]
    async fn status_not_connected_after_explicit_disconnect() {
        let mut f = fixture().await;
        f.state.connection.connect();
        let session = f.opened.recv().await.unwrap();
        session.events.send(TransportEvent::Connected);
        assert_eq!(f.events.recv().await, Some(TelemetryEvent::ConnectionChanged(true)));

        let (_, json) = call(&f.app, "GET", "/api/status", None).await;
        assert_eq!(json["connected"], true);

        f.state.connection.disconnect().await;
        let (_, json) = call(&f.app, "GET", "/api/status", None).await;
        assert_eq!(json["connected"], false);
        assert_eq!(json["connection"], "disconnected");
    }

    // -- POST ---------------------------------------------------------------

    #[tokio::test]
    async fn reconnect_opens_a_session() {
        let mut f = fixture().await;
        let (status, _) = call(&f.app, "POST", "/api/reconnect", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let session = f.opened.recv().await.unwrap();
        assert!(session.options.client_id.starts_with("soil-monitor-"));
    }
}
