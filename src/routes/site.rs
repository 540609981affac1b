//! Catch-all handler serving static sites by host.

use axum::{
    extract::{Request, State},
    http::header::HOST,
    response::Response,
};

use crate::access_log::{AccessRecord, RequestSummary};
use crate::sites::ResolvedRoute;
use crate::state::AppState;

/// Resolve the request against its host's document root and serve the file.
///
/// The access record is queued once the response is built.
pub async fn serve(State(state): State<AppState>, request: Request) -> Response {
    let host = request_host(&request);
    let path = request.uri().path().to_string();
    let resolved = state.resolver.resolve(&host, &path).await;
    tracing::debug!(
        root = %resolved.root.display(),
        path = %resolved.path.display(),
        kind = ?resolved.kind,
        "Resolved request"
    );

    let summary = RequestSummary::from_request(&request, &resolved.host);
    let (response, outcome) = state.responder.serve(&resolved.path, request).await;

    state.access_log.record(AccessRecord {
        request: summary,
        route: ResolvedRoute::new(&resolved, outcome),
    });

    response
}

/// Host header, or the URI authority for HTTP/2 requests without one.
fn request_host(request: &Request) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string()
}
