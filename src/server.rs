use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    diagnostics::{self, DiagnosticsConfig, SharedDiagnostics},
    fragment::{FragmentGrid, FragmentScanner},
    scanner::{EndpointScanner, ScanConfig},
    types::{DiagnosticStep, EndpointResult, FragmentCandidate},
};

/// Handles shared by all request handlers. Each scanner enforces its own
/// single-session policy, so the state itself needs no extra locking.
#[derive(Clone)]
pub struct AppState {
    scanner: Arc<EndpointScanner>,
    fragment: Arc<FragmentScanner>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            scanner: Arc::new(EndpointScanner::new()),
            fragment: Arc::new(FragmentScanner::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// "idle" | "scanning" | "fragment"
    pub state: String,
    /// Progress of whichever scan is active, in [0, 1].
    pub progress: f32,
    pub found: u64,
    pub attempted: u64,
    pub detail: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub ranges: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct FragmentRequest {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct DiagnosticsRequest {
    pub target: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub steps: Vec<DiagnosticStep>,
    pub remediation: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/fragment", post(post_fragment))
        .route("/stop", post(post_stop))
        .route("/results", get(get_results))
        .route("/fragments", get(get_fragments))
        .route("/diagnostics", get(get_diagnostics))
        .with_state(state);
    Router::new().nest("/api", api)
}

pub async fn spawn_server(bind: &str) -> Result<()> {
    let app = router(AppState::new());
    info!("serving control API on http://{bind}");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let shared = app.scanner.shared();
    let (state, progress, detail) = if app.scanner.is_active() {
        ("scanning", shared.progress(), shared.status_text().await)
    } else if app.fragment.is_active() {
        (
            "fragment",
            app.fragment.shared().progress(),
            app.fragment.shared().status_text().await,
        )
    } else {
        ("idle", shared.progress(), shared.status_text().await)
    };
    let out = Status {
        state: state.to_string(),
        progress,
        found: shared.found.load(std::sync::atomic::Ordering::Relaxed),
        attempted: shared.attempted.load(std::sync::atomic::Ordering::Relaxed),
        detail,
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> Json<Vec<EndpointResult>> {
    Json(app.scanner.results().await)
}

async fn get_fragments(State(app): State<AppState>) -> Json<Vec<FragmentCandidate>> {
    Json(app.fragment.candidates().await)
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let defaults = ScanConfig::default();
    let cfg = ScanConfig {
        ranges: req.ranges,
        concurrency: req.concurrency.unwrap_or(defaults.concurrency),
        timeout: Duration::from_millis(req.timeout_ms.unwrap_or(1000)),
        max_results: req.max_results.unwrap_or(defaults.max_results),
        port: req.port.unwrap_or(defaults.port),
    };
    match app.scanner.start(cfg).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn post_fragment(
    State(app): State<AppState>,
    Json(req): Json<FragmentRequest>,
) -> impl IntoResponse {
    let port = req.port.unwrap_or(443);
    match app
        .fragment
        .start_deep_scan(req.host, port, FragmentGrid::default())
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

/// Stops whichever session is running. Safe to call when idle.
async fn post_stop(State(app): State<AppState>) -> StatusCode {
    app.scanner.stop().await;
    app.fragment.stop().await;
    StatusCode::OK
}

/// Diagnostics are quick enough to run inline with the request.
async fn get_diagnostics(
    State(_app): State<AppState>,
    Query(req): Query<DiagnosticsRequest>,
) -> Json<DiagnosticsResponse> {
    let cfg = DiagnosticsConfig::for_target(req.target, req.port.unwrap_or(443));
    let shared = SharedDiagnostics::new();
    let steps = diagnostics::run_diagnostics(&cfg, &shared).await;
    let remediation = diagnostics::remediation(&steps).map(str::to_string);
    Json(DiagnosticsResponse { steps, remediation })
}
