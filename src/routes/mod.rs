//! HTTP routes.
//!
//! Everything except the health probe falls through to the site handler, which
//! serves files for whatever host the request names. Every response carries the
//! Server header and, outside dev mode, the Content-Security-Policy header.
//!
//! `/health` is answered for every host before site resolution, so a site's own
//! `health` file at its root is never served and the request is not logged.
//!
//! Request tracing is enabled via middleware that generates a unique request ID
//! for each incoming request, allowing correlation of all logs within a request.

pub mod health;
pub mod site;

use std::time::Duration;

use axum::{middleware, routing::get, Router};
use http::header::{HeaderValue, CONTENT_SECURITY_POLICY, SERVER};
use tower_http::{
    compression::CompressionLayer, set_header::SetResponseHeaderLayer, timeout::TimeoutLayer,
};

use crate::config::{REQUEST_TIMEOUT_SECS, SERVER_HEADER};
use crate::middleware::request_id_layer;
use crate::state::AppState;

/// Creates the Axum router with the health probe, the site fallback and
/// response header layers.
#[allow(deprecated)]
pub fn create_router(state: AppState) -> Router {
    let csp = state
        .config
        .content_security_policy()
        .and_then(|value| HeaderValue::from_str(&value).ok());

    // Health check - answered before any host handling
    let health_routes = Router::new().route("/health", get(health::health));

    let mut router = Router::new()
        .merge(health_routes)
        .fallback(site::serve)
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(SetResponseHeaderLayer::overriding(
            SERVER,
            HeaderValue::from_static(SERVER_HEADER),
        ));

    if let Some(csp) = csp {
        router = router.layer(SetResponseHeaderLayer::overriding(
            CONTENT_SECURITY_POLICY,
            csp,
        ));
    }

    // Request ID middleware - creates root span with request_id for correlation
    router.layer(middleware::from_fn(request_id_layer))
}
