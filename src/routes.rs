use axum::{extract::DefaultBodyLimit, middleware, routing::get, routing::post, Router};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    handlers,
    security::middleware::{auth_throttle_middleware, security_middleware},
    state::AppState,
};

const MAX_BODY_BYTES: usize = 16 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn create_router(state: AppState) -> Router {
    // Account endpoints get the per-IP throttle on top of the shared security context.
    // Throttled requests are refused before their body is read.
    let accounts = Router::new()
        .route("/api/register", post(handlers::register))
        .route("/api/login", post(handlers::login))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(state.clone(), auth_throttle_middleware))
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        );

    Router::new()
        .merge(accounts)
        .route("/ws", get(handlers::websocket_handler))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(state.clone(), security_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::persistence::MemoryRepository;
    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{Request, StatusCode},
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app(config: Config) -> Router {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let state = AppState::with_repository(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(ManualClock::new(0)),
            handle,
        )
        .await
        .unwrap();
        create_router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let app = app(Config::default()).await;

        let response = app
            .clone()
            .oneshot(json_post("/api/register", r#"{"name":"owner","secret":"hunter22"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["role"], "OWNER");
        assert!(body["token"].as_str().is_some());
        assert!(body.get("credential").is_none());

        let response = app
            .clone()
            .oneshot(json_post("/api/register", r#"{"name":"owner","secret":"hunter22"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(json_post("/api/login", r#"{"name":"owner","secret":"wrong"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(json_post("/api/login", r#"{"name":"owner","secret":"hunter22"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_account_endpoints_are_throttled() {
        let config = Config {
            auth_requests_per_minute: 2,
            ..Config::default()
        };
        let app = app(config).await;

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(json_post("/api/login", r#"{"name":"ghost","secret":"nope"}"#))
                .await
                .unwrap();
            statuses.push(response.status());
        }
        assert_eq!(
            statuses,
            vec![
                StatusCode::UNAUTHORIZED,
                StatusCode::UNAUTHORIZED,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_account_body_is_rejected() {
        let app = app(Config::default()).await;
        let secret = "x".repeat(MAX_BODY_BYTES);
        let body = format!(r#"{{"name":"owner","secret":"{}"}}"#, secret);

        let response = app
            .clone()
            .oneshot(json_post("/api/register", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = app
            .oneshot(json_post("/api/register", r#"{"name":"owner","secret":"hunter22"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app = app(Config::default()).await;

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["storage"], "memory");

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
