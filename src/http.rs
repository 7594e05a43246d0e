use crate::cache::{RefreshCache, SnapshotView};
use crate::metrics::Metrics;
use crate::state::{GpuRecord, MetricFailure, SystemResources, UserResourceRecord};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub cache: Arc<RefreshCache>,
}

/// Body of `/api/gpu-status` and `/api/refresh`.
#[derive(Debug, serde::Serialize)]
pub struct ApiStatus<'a> {
    pub captured_at_unix: i64,
    pub captured_at: Option<String>,
    pub is_stale: bool,
    pub last_error: Option<&'a str>,
    pub gpus: &'a [GpuRecord],
    pub users: &'a [UserResourceRecord],
    pub system: &'a SystemResources,
    pub failures: &'a [MetricFailure],
}

impl<'a> From<&'a SnapshotView> for ApiStatus<'a> {
    fn from(view: &'a SnapshotView) -> Self {
        let snapshot = &view.snapshot;
        let captured_at = (snapshot.captured_at_unix > 0).then(|| {
            let at = UNIX_EPOCH + Duration::from_secs(snapshot.captured_at_unix as u64);
            humantime::format_rfc3339_seconds(at).to_string()
        });
        Self {
            captured_at_unix: snapshot.captured_at_unix,
            captured_at,
            is_stale: view.is_stale,
            last_error: view.last_error.as_deref(),
            gpus: &snapshot.gpus,
            users: &snapshot.users,
            system: &snapshot.system,
            failures: &snapshot.failures,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Oldest acceptable snapshot in seconds; older ones trigger a refresh.
    pub max_age: Option<u64>,
}

pub fn build_router(metrics: Arc<Metrics>, cache: Arc<RefreshCache>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/gpu-status", get(gpu_status_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(HttpAppState { metrics, cache })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.update_from_view(&state.cache.peek().await);
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn gpu_status_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let view = match query.max_age {
        Some(secs) => {
            let cache = &state.cache;
            cache.bounded(cache.get_current(Duration::from_secs(secs))).await
        }
        None => state.cache.get_snapshot().await,
    };
    Json(ApiStatus::from(&view)).into_response()
}

async fn refresh_handler(State(state): State<HttpAppState>) -> Response {
    let view = state.cache.bounded(state.cache.force_refresh()).await;
    Json(ApiStatus::from(&view)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::FakeCollector;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    fn app(collector: &Arc<FakeCollector>) -> (Router, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics");
        let cache = Arc::new(
            RefreshCache::new(
                collector.clone(),
                Duration::from_secs(60),
                Duration::from_secs(2),
            )
            .with_metrics(metrics.clone()),
        );
        (build_router(metrics.clone(), cache), metrics)
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app(&FakeCollector::new());
        let (status, body) = send(app, "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn gpu_status_returns_snapshot_json() {
        let collector = FakeCollector::new();
        let (app, _) = app(&collector);

        let (status, body) = send(app, "GET", "/api/gpu-status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["is_stale"], false);
        assert_eq!(json["last_error"], serde_json::Value::Null);
        assert_eq!(json["gpus"][0]["name"], "Tesla T4");
        assert_eq!(json["gpus"][0]["memory_usage_percent"], 6.25);
        assert_eq!(json["system"]["memory"], serde_json::Value::Null);
        assert_eq!(json["captured_at"], "1970-01-01T00:00:01Z");
        assert_eq!(collector.calls(), 1);
    }

    #[tokio::test]
    async fn unreachable_host_is_reported_in_status() {
        let collector = FakeCollector::new();
        collector.unreachable.store(true, Ordering::SeqCst);
        let (app, _) = app(&collector);

        let (status, body) = send(app, "GET", "/api/gpu-status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["last_error"], "Connection refused");
        assert_eq!(json["failures"].as_array().map(Vec::len), Some(6));
        assert_eq!(json["failures"][0]["kind"], "connection");
    }

    #[tokio::test]
    async fn refresh_forces_a_collection() {
        let collector = FakeCollector::new();
        let (app, _) = app(&collector);

        let (status, _) = send(app.clone(), "GET", "/api/gpu-status").await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(app.clone(), "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"captured_at_unix\":2"));
        assert_eq!(collector.calls(), 2);

        let (status, _) = send(app, "GET", "/api/refresh").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test(start_paused = true)]
    async fn max_age_query_controls_reuse() {
        let collector = FakeCollector::new();
        let (app, _) = app(&collector);

        send(app.clone(), "GET", "/api/gpu-status").await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let (status, body) = send(app.clone(), "GET", "/api/gpu-status?max_age=60").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"captured_at_unix\":1"));
        assert_eq!(collector.calls(), 1);

        let (_, body) = send(app.clone(), "GET", "/api/gpu-status?max_age=5").await;
        assert!(body.contains("\"captured_at_unix\":2"));
        assert_eq!(collector.calls(), 2);

        let (status, _) = send(app, "GET", "/api/gpu-status?max_age=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_request_returns_after_refresh_wait() {
        let collector = FakeCollector::new();
        collector.set_delay(Duration::from_secs(30));
        let (app, _) = app(&collector);

        let started = tokio::time::Instant::now();
        let (status, body) = send(app, "POST", "/api/refresh").await;
        let waited = started.elapsed();

        assert_eq!(status, StatusCode::OK);
        assert!(waited < Duration::from_secs(30));
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["is_stale"], true);
        assert_eq!(json["last_error"], "no snapshot has been collected yet");
        assert_eq!(collector.calls(), 1);
    }

    #[tokio::test]
    async fn metrics_reflect_last_refresh() {
        let collector = FakeCollector::new();
        let (app, metrics) = app(&collector);

        send(app.clone(), "POST", "/api/refresh").await;
        let (status, body) = send(app, "GET", "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("gpumond_gpu_count 1"));
        assert!(body.contains("gpumond_collections_total 1"));
        assert_eq!(metrics.gpumond_scrape_count_total.get(), 1.0);
    }
}
