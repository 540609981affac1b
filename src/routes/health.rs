//! Health check endpoint for container orchestration.
//!
//! A liveness probe that returns 200 OK whenever the process can answer HTTP.
//! It is routed ahead of the site fallback so probes never register a domain.

/// Health check handler.
pub async fn health() -> &'static str {
    "ok"
}
