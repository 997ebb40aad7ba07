//! Execution Kernel admin/demo server
//!
//! Exposes the kernel's validate/execute/stats surface over HTTP for
//! local exercising and smoke tests. Operations are registered at
//! startup from a small built-in demo set; a real deployment wires in
//! its own operation callables before serving traffic.

use std::collections::HashMap;
use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::{buffer::BufferLayer, limit::RateLimitLayer, BoxError, ServiceBuilder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use execution_kernel::{
    AutonomyLevel, ExecutionContext, ExecutionKernel, InMemoryAuditSink, KernelConfig,
};

struct AppState {
    kernel: ExecutionKernel,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    agent_id: String,
    operation: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CircuitOverrideRequest {
    level: String,
}

fn echo_callable() -> execution_kernel::OperationCallable {
    Box::new(|params: HashMap<String, serde_json::Value>| {
        Box::pin(async move { Ok(serde_json::Value::Object(params.into_iter().collect())) })
    })
}

fn register_demo_operations(kernel: &ExecutionKernel) {
    let _ = kernel.register_operation("read_file", "reads a file from disk", echo_callable());
    let _ = kernel.register_operation("search_code", "searches the codebase", echo_callable());
    let _ = kernel.register_operation("echo", "echoes its input parameters", echo_callable());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    execution_kernel::init_tracing();

    let config = KernelConfig::from_env();
    let audit_sink = Arc::new(InMemoryAuditSink::new(10_000));
    let kernel = ExecutionKernel::new(config, audit_sink);
    register_demo_operations(&kernel);

    let state = Arc::new(AppState { kernel });

    let app = Router::new()
        .route("/health", get(health))
        .route("/validate", post(validate))
        .route("/execute", post(execute))
        .route("/stats", get(stats))
        .route("/circuit-breaker", get(circuit_status).post(override_circuit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|err: BoxError| async move {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("unhandled internal error: {}", err),
                    )
                }))
                .layer(BufferLayer::new(1024))
                .layer(RateLimitLayer::new(100, std::time::Duration::from_secs(60))),
        )
        .layer(axum::middleware::from_fn(auth_middleware))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!(%addr, "execution kernel server listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn auth_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let auth_header = req.headers().get("Authorization").and_then(|h| h.to_str().ok());

    match auth_header {
        Some(auth) if auth.starts_with("Bearer ") || auth.starts_with("ApiKey ") => {
            let token = auth.splitn(2, ' ').nth(1).unwrap_or("");
            if token.is_empty() {
                return Err(StatusCode::UNAUTHORIZED);
            }
            Ok(next.run(req).await)
        }
        _ => {
            tracing::warn!(path = %req.uri().path(), "unauthorized access attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn build_context(req: ValidateRequest) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(req.agent_id, req.operation, req.parameters);
    if let Some(domain) = req.domain {
        ctx = ctx.with_domain(domain);
    }
    ctx
}

async fn validate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateRequest>,
) -> Json<execution_kernel::ValidationResult> {
    let ctx = build_context(req);
    Json(state.kernel.validate(&ctx).await)
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let ctx = build_context(req);
    match state.kernel.execute(ctx).await {
        Ok(output) => Ok(Json(output)),
        Err(e) => Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<execution_kernel::KernelStatsSnapshot> {
    Json(state.kernel.get_stats())
}

async fn circuit_status(
    State(state): State<Arc<AppState>>,
) -> Json<execution_kernel::CircuitBreakerStatus> {
    Json(state.kernel.circuit_breaker().get_status())
}

async fn override_circuit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CircuitOverrideRequest>,
) -> Result<StatusCode, StatusCode> {
    let level = match req.level.to_uppercase().as_str() {
        "GREEN" => AutonomyLevel::Green,
        "AMBER" => AutonomyLevel::Amber,
        "RED" => AutonomyLevel::Red,
        "BLACK" => AutonomyLevel::Black,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    state.kernel.set_circuit_state(level).await;
    Ok(StatusCode::NO_CONTENT)
}
