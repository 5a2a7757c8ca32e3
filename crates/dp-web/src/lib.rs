//! Read-only HTTP surface of the dispatcher: status, metrics and recent logs.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use dp_sync::{DispatchMetrics, LogRing};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CRATE_NAME: &str = "dp-web";

/// Lines shown by `/logs` without an explicit count.
pub const DEFAULT_LOG_TAIL: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<DispatchMetrics>,
    pub logs: LogRing,
    pub started: DateTime<Utc>,
    pub version: String,
}

impl AppState {
    pub fn new(metrics: Arc<DispatchMetrics>, logs: LogRing, started: DateTime<Utc>) -> Self {
        Self {
            metrics,
            logs,
            started,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusDocument {
    status: &'static str,
    version: String,
    started: DateTime<Utc>,
}

#[derive(Template)]
#[template(path = "logs.html")]
struct LogsTemplate {
    lines: Vec<String>,
    requested: usize,
    started: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/logs", get(logs_handler))
        .route("/logs/{n}", get(logs_tail_handler))
        .with_state(Arc::new(state))
}

/// Serve until `token` is cancelled.
pub async fn serve(state: AppState, port: u16, token: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    info!("http surface stopped");
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusDocument> {
    Json(StatusDocument {
        status: "ok",
        version: state.version.clone(),
        started: state.started,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Response {
    render_logs(&state, DEFAULT_LOG_TAIL)
}

async fn logs_tail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(n): AxumPath<usize>,
) -> Response {
    render_logs(&state, n)
}

fn render_logs(state: &AppState, n: usize) -> Response {
    render_html(LogsTemplate {
        lines: state.logs.tail(n),
        requested: n,
        started: state.started.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}
