use crate::{health, images};
use axum::extract::{DefaultBodyLimit, MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use optiq_core::{ImageRepository, ObjectStore};
use optiq_queue::QueueClient;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Multipart bodies carry framing overhead on top of the 10 MiB image cap, so
/// the transport limit sits above it and the handler enforces the real bound.
const MAX_BODY_BYTES: usize = 12 * 1024 * 1024;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Shared clients handed to every request handler. All of them are internally
/// reference-counted and safe for concurrent use.
#[derive(Clone)]
pub struct AppState {
    pub repo: ImageRepository,
    pub store: ObjectStore,
    pub queue: Arc<QueueClient>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route(
            "/api/images",
            get(images::list_images).post(images::upload_image),
        )
        .route(
            "/api/images/:id",
            get(images::get_image).delete(images::delete_image),
        )
        .route("/health", get(health::health));

    if state.metrics.is_some() {
        router = router
            .route("/metrics", get(render_metrics))
            .layer(middleware::from_fn(track_requests));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// `GET /metrics` — Prometheus text exposition.
async fn render_metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Per-request counter and duration histogram, labeled by route template.
async fn track_requests(request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let method = request.method().to_string();

    let start = Instant::now();
    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("api.requests.total", &labels).increment(1);
    metrics::histogram!("api.request.duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limit_exceeds_upload_cap() {
        // The handler enforces 10 MiB; the transport limit must not shadow it.
        assert!(MAX_BODY_BYTES > images::MAX_UPLOAD_BYTES);
    }
}
