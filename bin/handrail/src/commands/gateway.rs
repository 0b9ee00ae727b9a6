use std::sync::Arc;

use handrail_core::{Config, Error, Paths, StepView};
use handrail_orchestrator::{
    LlmPlanner, LlmRefiner, Orchestrator, RuntimeConfig, SessionHandle, SseConnector,
};
use handrail_providers::{create_planner_provider, create_refiner_provider, Provider};
use tracing::info;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

// ---------------------------------------------------------------------------
// Shared state passed to HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct GatewayState {
    handle: SessionHandle,
    config: Config,
}

#[derive(Deserialize)]
struct StartSessionRequest {
    instruction: String,
}

#[derive(Serialize)]
struct StartSessionResponse {
    steps: Vec<StepView>,
}

#[derive(Serialize)]
struct ActionResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    model: String,
    uptime_secs: u64,
    version: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_health(State(state): State<GatewayState>) -> impl IntoResponse {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(std::time::Instant::now);

    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.config.planner.model.clone(),
        uptime_secs: start.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_session_start(
    State(state): State<GatewayState>,
    Json(req): Json<StartSessionRequest>,
) -> Response {
    match state.handle.start_session(&req.instruction).await {
        Ok(steps) => (StatusCode::OK, Json(StartSessionResponse { steps })).into_response(),
        // One session at a time; a second start is rejected, not queued.
        Err(Error::Session(message)) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse { error: message }),
        )
            .into_response(),
        Err(e @ Error::Parse(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn handle_session_confirm(State(state): State<GatewayState>) -> Response {
    action_response(state.handle.confirm_step().await)
}

async fn handle_session_reject(State(state): State<GatewayState>) -> Response {
    action_response(state.handle.reject_steps().await)
}

async fn handle_session_cancel(State(state): State<GatewayState>) -> Response {
    action_response(state.handle.cancel_session().await)
}

async fn handle_session_status(State(state): State<GatewayState>) -> Response {
    match state.handle.status().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

fn action_response(result: handrail_core::Result<()>) -> Response {
    match result {
        Ok(()) => Json(ActionResponse {
            status: "ok".to_string(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry
// ---------------------------------------------------------------------------

pub async fn run(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let planner_provider: Arc<dyn Provider> = Arc::from(create_planner_provider(&config)?);
    let refiner_provider: Arc<dyn Provider> = Arc::from(create_refiner_provider(&config)?);

    let connector = Arc::new(SseConnector::from_config(&config.automation));
    let parser = Arc::new(LlmPlanner::new(planner_provider, config.planner.max_steps));
    let refiner = Arc::new(LlmRefiner::new(refiner_provider));

    let orchestrator = Orchestrator::new(
        connector,
        parser,
        refiner,
        RuntimeConfig::from_config(&config),
    );

    let host = host.unwrap_or_else(|| config.gateway.host.clone());
    let port = port.unwrap_or(config.gateway.port);

    let state = GatewayState {
        handle: orchestrator.handle(),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/v1/health", get(handle_health))
        .route("/v1/session", post(handle_session_start))
        .route("/v1/session/status", get(handle_session_status))
        .route("/v1/session/confirm", post(handle_session_confirm))
        .route("/v1/session/reject", post(handle_session_reject))
        .route("/v1/session/cancel", post(handle_session_cancel))
        .layer(build_api_cors_layer(&config))
        .with_state(state);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Gateway listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Drop any in-flight session so the automation server sees a clean close.
    orchestrator.handle().cancel_session().await.ok();
    info!("Gateway stopped");
    Ok(())
}

fn build_api_cors_layer(config: &Config) -> CorsLayer {
    let _ = config;
    CorsLayer::permissive().allow_credentials(false)
}
