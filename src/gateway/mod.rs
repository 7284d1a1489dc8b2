//! The HTTP gateway: router assembly plus the modules it's built from.

pub mod dispatch;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;

use self::state::AppState;

/// 1 MiB, per §4.1's body cap.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Assembles the full route table with its middleware stack layered on.
/// Rate limiting is scoped to `/mcp/*` only; everything else gets request-id
/// tracking, CORS, and the body-size cap.
pub fn build_router(state: AppState) -> Router {
    let mcp_routes = Router::new()
        .route("/mcp/tools", get(routes::list_tools))
        .route("/mcp/execute", post(routes::execute))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit_mw));

    let app_routes = Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/api/v1/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/api/sessions/active", get(routes::sessions_active))
        .route("/api/sessions/stats", get(routes::sessions_stats))
        .route("/api/sessions/{id}/timeline", get(routes::session_timeline))
        .route("/api/sessions/{id}/events", get(routes::session_events))
        .route("/webhooks/{provider}", post(routes::webhook));

    Router::new()
        .merge(mcp_routes)
        .merge(app_routes)
        .fallback(middleware::not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::cors_layer(&state.config.cors_allowed_origins))
        .layer(from_fn(middleware::request_id_mw))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn with_peer(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        builder.extension(ConnectInfo(addr))
    }

    #[tokio::test]
    async fn root_reports_service_metadata() {
        let state = crate::test_support::test_state().await;
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_404_with_envelope() {
        let state = crate::test_support::test_state().await;
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_400() {
        let state = crate::test_support::test_state().await;
        let app = build_router(state);
        let request = with_peer(
            Request::builder()
                .method("POST")
                .uri("/mcp/execute")
                .header("content-type", "application/json"),
        )
        .body(Body::from(r#"{"tool":"not_a_real_tool","parameters":{}}"#))
        .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
