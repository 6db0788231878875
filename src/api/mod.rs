//! HTTP surface
//!
//! The query endpoints (OpenTSDB-compatible plus the expression family)
//! and the fleet control endpoints peers use during balancing. Every
//! response carries an `X-Processed-Bytes` header summarizing bytes read
//! from storage; endpoints that touch no storage report zero.

pub mod handlers;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, head, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::query::QueryService;
use crate::telnet::manager::Manager;

/// Header summarizing bytes read from storage for a response
pub const PROCESSED_BYTES_HEADER: &str = "X-Processed-Bytes";

/// Shared handler state
pub struct AppState {
    /// The query planner/executor
    pub query: Arc<QueryService>,
    /// The telnet fleet manager
    pub manager: Arc<Manager>,
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // query surface
        .route("/keysets/:keyset/api/query", post(handlers::query))
        .route(
            "/keysets/:keyset/query/expression",
            get(handlers::expression_query_get).post(handlers::expression_query_post),
        )
        .route(
            "/api/query/expression/check",
            get(handlers::expression_check_get).post(handlers::expression_check_post),
        )
        .route(
            "/api/query/expression/parse",
            get(handlers::expression_parse_get).post(handlers::expression_parse_post),
        )
        .route(
            "/api/query/expression/compile",
            post(handlers::expression_compile),
        )
        .route(
            "/keysets/:keyset/expression/expand",
            get(handlers::expression_expand_get).post(handlers::expression_expand_post),
        )
        .route("/keysets/:keyset/api/search/lookup", get(handlers::lookup))
        .route("/keysets/:keyset/api/suggest", get(handlers::suggest))
        // fleet control surface
        .route(
            "/node/telnet/connections",
            head(handlers::connection_count),
        )
        .route(
            "/node/telnet/balancing/halt",
            head(handlers::halt_balancing),
        )
        .with_state(state)
        .layer(middleware::from_fn(ensure_processed_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Default the processed-bytes header on responses that did not set it
async fn ensure_processed_bytes(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    if !response.headers().contains_key(PROCESSED_BYTES_HEADER) {
        response
            .headers_mut()
            .insert(PROCESSED_BYTES_HEADER, HeaderValue::from_static("0"));
    }
    response
}
