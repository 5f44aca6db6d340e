//! HTTP server for peer admission, health checks and metrics
//!
//! - `POST /api/session`: offer in, answer out
//! - `GET /health`, `GET /clients`, `GET /metrics`

use crate::error::SinkError;
use crate::signaling::ErrorResponse;
use crate::web::shared::SharedState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde_json::json;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use tokio::net::TcpListener;

/// How many ports past the requested one are probed
const PORT_SEARCH_SPAN: u32 = 100;

/// Build the application router
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/session", post(session_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/clients", get(clients_handler))
        .with_state(state)
}

/// Bind the signaling listener according to the HTTP config.
///
/// Returns the listener and the port it actually got.
pub async fn bind_listener(state: &SharedState) -> io::Result<(TcpListener, u16)> {
    let http = &state.config.http;
    let port = if http.auto_port {
        find_available_port(http.port)?
    } else {
        http.port
    };
    if port != http.port && http.port != 0 {
        warn!("Port {} is in use, using {} instead", http.port, port);
    }

    let listener = TcpListener::bind((http.host.as_str(), port)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Serve the router on an already bound listener
pub async fn run_http_server(listener: TcpListener, state: Arc<SharedState>) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!("HTTP server listening on http://{}", addr);
    info!("Admission endpoint at http://{}/api/session", addr);

    axum::serve(listener, router(state)).await
}

/// Find a free TCP port.
///
/// `0` asks the OS for any port; otherwise `start_port` and the following
/// ports are tried in order.
pub fn find_available_port(start_port: u16) -> io::Result<u16> {
    if start_port == 0 {
        let listener = StdTcpListener::bind(("0.0.0.0", 0))?;
        return Ok(listener.local_addr()?.port());
    }

    let end = (start_port as u32 + PORT_SEARCH_SPAN).min(u16::MAX as u32 + 1);
    for port in start_port as u32..end {
        if StdTcpListener::bind(("0.0.0.0", port as u16)).is_ok() {
            return Ok(port as u16);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no available ports found between {} and {}", start_port, end - 1),
    ))
}

/// Admission handler
async fn session_handler(State(state): State<Arc<SharedState>>, body: Bytes) -> Response {
    match state.signaling.handle(&body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &SinkError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(err))).into_response()
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> String {
    let uptime = state.uptime();
    let clients = state.connection_count();
    let status = if state.sink.is_started() { "healthy" } else { "stopped" };

    format!(
        r#"{{
  "status": "{}",
  "uptime_seconds": {:.2},
  "connections": {},
  "version": "{}"
}}"#,
        status,
        uptime.as_secs_f64(),
        clients,
        env!("CARGO_PKG_VERSION")
    )
}

async fn clients_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let ids = state.sink.peer_ids();
    Json(json!({
        "count": ids.len(),
        "sessions": ids,
    }))
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(State(state): State<Arc<SharedState>>) -> String {
    let stats = state.sink.stats();

    format!(
        r#"# HELP websink_uptime_seconds Server uptime in seconds
# TYPE websink_uptime_seconds counter
websink_uptime_seconds {}
# HELP websink_started Whether the sink is started
# TYPE websink_started gauge
websink_started {}
# HELP websink_peers Currently connected peers
# TYPE websink_peers gauge
websink_peers {}
# HELP websink_samples_written_total Samples handed to the distribution track
# TYPE websink_samples_written_total counter
websink_samples_written_total {}
# HELP websink_samples_dropped_total Samples dropped in live mode with no peers
# TYPE websink_samples_dropped_total counter
websink_samples_dropped_total {}
# HELP websink_delivery_failures_total Per-peer sample deliveries that failed
# TYPE websink_delivery_failures_total counter
websink_delivery_failures_total {}
# HELP websink_admissions_total Successful peer admissions
# TYPE websink_admissions_total counter
websink_admissions_total {}
# HELP websink_admission_failures_total Failed peer admissions
# TYPE websink_admission_failures_total counter
websink_admission_failures_total {}
"#,
        state.uptime().as_secs_f64(),
        stats.started as u8,
        stats.peers,
        stats.samples_written,
        stats.samples_dropped,
        stats.delivery_failures,
        stats.admissions,
        stats.admission_failures
    )
}
