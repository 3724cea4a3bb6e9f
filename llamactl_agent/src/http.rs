//! JSON routes. Status and GPU replies read the monitor's cached snapshot
//! and never wait on device or process I/O.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::launcher::{list_models, ServerStatus, StopReport};
use crate::settings::LaunchSettings;
use crate::state::AppState;
use crate::types::HealthSnapshot;
use crate::ws::ws_handler;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/diagnose", post(diagnose))
        .route("/gpu", get(gpu))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/logs", get(logs))
        .route("/models", get(models))
        .route("/settings", get(get_settings).post(save_settings))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn failure(code: StatusCode, msg: impl Into<String>) -> Response {
    let msg = msg.into();
    (code, Json(json!({ "success": false, "status": msg }))).into_response()
}

#[derive(Serialize)]
struct StatusBody<'a> {
    #[serde(flatten)]
    server: ServerStatus,
    snapshot: &'a HealthSnapshot,
}

async fn status(State(state): State<AppState>) -> Response {
    let snapshot = state.monitor.get_snapshot();
    Json(StatusBody {
        server: state.server_status(),
        snapshot: &snapshot,
    })
    .into_response()
}

async fn gpu(State(state): State<AppState>) -> Response {
    let snapshot = state.monitor.get_snapshot();
    Json(&snapshot.devices).into_response()
}

async fn diagnose(State(state): State<AppState>) -> Response {
    Json(state.monitor.request_diagnosis_now().await).into_response()
}

async fn start(State(state): State<AppState>, Json(settings): Json<LaunchSettings>) -> Response {
    if let Err(e) = settings.save(&state.settings_path) {
        error!("saving launch settings: {e}");
    }
    let mut launcher = state.launcher.lock().await;
    match launcher.start(&settings).await {
        Ok(server) => {
            state.remember(&server);
            let model = server.model.clone().unwrap_or_default();
            info!("model {model} started");
            Json(json!({
                "success": true,
                "status": format!("Model '{model}' started on {}:{}", settings.host, settings.port),
                "server": server,
            }))
            .into_response()
        }
        Err(e) => {
            state.remember(&launcher.status());
            failure(StatusCode::OK, format!("Error: {e}"))
        }
    }
}

#[derive(Serialize)]
struct StopBody {
    success: bool,
    status: String,
    #[serde(flatten)]
    report: StopReport,
}

async fn stop(State(state): State<AppState>) -> Response {
    let mut launcher = state.launcher.lock().await;
    let report = launcher.stop().await;
    state.remember(&launcher.status());
    Json(StopBody {
        success: report.verdict.is_clean(),
        status: report.message.clone(),
        report,
    })
    .into_response()
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    since: u64,
}

async fn logs(State(state): State<AppState>, Query(q): Query<LogsQuery>) -> Response {
    let page = state
        .logs
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .since(q.since);
    Json(page).into_response()
}

async fn models(State(state): State<AppState>) -> Response {
    match list_models(&state.model_dir) {
        Ok(list) => Json(list).into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_settings(State(state): State<AppState>) -> Response {
    Json(LaunchSettings::load(&state.settings_path)).into_response()
}

async fn save_settings(
    State(state): State<AppState>,
    Json(settings): Json<LaunchSettings>,
) -> Response {
    match settings.save(&state.settings_path) {
        Ok(()) => Json(json!({ "success": true, "status": "Settings saved" })).into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
