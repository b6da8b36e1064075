use crate::api::render_document;
use crate::metrics::Metrics;
use crate::state::SharedSnapshot;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub snapshot: SharedSnapshot,
}

pub fn build_router(metrics: Arc<Metrics>, snapshot: SharedSnapshot) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .with_state(HttpAppState { metrics, snapshot })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn with_content_type(body: impl Into<Body>, content_type: &'static str) -> Response {
    let mut response = Response::new(body.into());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => with_content_type(encoded, "text/plain; version=0.0.4"),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    let snapshot = state.snapshot.load().await;
    match render_document(&snapshot) {
        Ok(mut body) => {
            body.push('\n');
            with_content_type(body, "application/json")
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize snapshot: {err}"),
        )
            .into_response(),
    }
}
