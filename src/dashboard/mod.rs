use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::bot::BotManager;
use crate::error::{CentrumError, ErrorKind};
use crate::model::dispatch::Dispatch;
use crate::model::settings::CentrumSettings;
use crate::model::unit::Unit;
use crate::store::{DispatchStore, SettingsStore, TakeResponse};

#[derive(Clone)]
pub struct DashboardState {
    pub node_id: u64,
    pub replica: Uuid,
    pub dispatches: DispatchStore,
    pub settings: SettingsStore,
    pub bots: Arc<BotManager>,
}

#[derive(Serialize)]
struct StatusResponse {
    node_id: u64,
    replica: String,
    dispatches: usize,
    units: usize,
    bots: Vec<String>,
}

#[derive(Deserialize)]
struct CreateDispatchRequest {
    message: String,
    #[serde(default)]
    description: Option<String>,
    x: f64,
    y: f64,
    #[serde(default)]
    postal: Option<String>,
    #[serde(default)]
    anon: bool,
    #[serde(default)]
    creator_id: Option<u64>,
    /// Extra jobs that should see the dispatch.
    #[serde(default)]
    jobs: Vec<String>,
}

#[derive(Deserialize)]
struct TakeDispatchRequest {
    unit_id: u64,
    dispatch_ids: Vec<u64>,
    response: TakeResponse,
    #[serde(default)]
    user_id: Option<u64>,
}

#[derive(Serialize)]
struct TakeDispatchResponse {
    dispatches: Vec<Dispatch>,
    failures: Vec<TakeFailure>,
}

#[derive(Serialize)]
struct TakeFailure {
    dispatch_id: u64,
    kind: String,
    error: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    kind: String,
    error: String,
}

/// Engine error rendered as a JSON body with a matching status code.
struct ApiError(CentrumError);

impl From<CentrumError> for ApiError {
    fn from(err: CentrumError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyCompleted | ErrorKind::DuplicateKey => StatusCode::CONFLICT,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::NotOnDuty | ErrorKind::ModeForbidsAction | ErrorKind::NoJobsSpecified => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::BackingStoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            kind: kind.to_string(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route(
            "/api/jobs/:job/dispatches",
            get(list_dispatches_handler).post(create_dispatch_handler),
        )
        .route("/api/jobs/:job/dispatches/take", post(take_dispatch_handler))
        .route("/api/jobs/:job/units", get(list_units_handler))
        .route("/api/jobs/:job/settings", get(settings_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(StatusResponse {
        node_id: state.node_id,
        replica: state.replica.to_string(),
        dispatches: state.dispatches.dispatches().len().await,
        units: state.dispatches.units().units().len().await,
        bots: state.bots.running_jobs().await,
    })
}

async fn list_dispatches_handler(
    State(state): State<DashboardState>,
    Path(job): Path<String>,
) -> Json<Vec<Dispatch>> {
    let dispatches = state
        .dispatches
        .list(&[job])
        .await
        .iter()
        .map(Dispatch::public_view)
        .collect();
    Json(dispatches)
}

async fn create_dispatch_handler(
    State(state): State<DashboardState>,
    Path(job): Path<String>,
    Json(payload): Json<CreateDispatchRequest>,
) -> Result<(StatusCode, Json<Dispatch>), ApiError> {
    let mut jobs = vec![job];
    jobs.extend(payload.jobs);

    let mut dsp = Dispatch::new(jobs, payload.message, payload.x, payload.y);
    dsp.description = payload.description;
    dsp.postal = payload.postal;
    dsp.anon = payload.anon;
    dsp.creator_id = payload.creator_id;

    let created = state.dispatches.create(dsp).await?;
    Ok((StatusCode::CREATED, Json(created.public_view())))
}

async fn take_dispatch_handler(
    State(state): State<DashboardState>,
    Path(job): Path<String>,
    Json(payload): Json<TakeDispatchRequest>,
) -> Result<Json<TakeDispatchResponse>, ApiError> {
    let outcome = state
        .dispatches
        .take_dispatch(
            &job,
            payload.unit_id,
            &payload.dispatch_ids,
            payload.response,
            payload.user_id,
        )
        .await?;

    Ok(Json(TakeDispatchResponse {
        dispatches: outcome.dispatches.iter().map(Dispatch::public_view).collect(),
        failures: outcome
            .failures
            .into_iter()
            .map(|(dispatch_id, e)| TakeFailure {
                dispatch_id,
                kind: e.kind().to_string(),
                error: e.to_string(),
            })
            .collect(),
    }))
}

async fn list_units_handler(
    State(state): State<DashboardState>,
    Path(job): Path<String>,
) -> Json<Vec<Unit>> {
    Json(state.dispatches.units().list(&[job]).await)
}

async fn settings_handler(
    State(state): State<DashboardState>,
    Path(job): Path<String>,
) -> Json<CentrumSettings> {
    Json(state.settings.get(&job).await)
}
