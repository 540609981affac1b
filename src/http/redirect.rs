//! HTTP to HTTPS redirect server.
//!
//! Spawns a lightweight HTTP server on port 80 (or configured port) that sends
//! every request to the same host and path over HTTPS.

use std::net::SocketAddr;

use axum::http::Uri;
use axum::response::Redirect;
use axum::routing::any;
use axum::Router;
use axum_extra::extract::Host;

use crate::sites::strip_port;

/// Spawn an HTTP server that redirects all requests to HTTPS.
///
/// This runs in the background and does not block.
pub fn spawn_redirect_server(http_port: u16, https_port: u16) {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], http_port));

        tracing::info!(
            http_port = %http_port,
            https_port = %https_port,
            "Starting HTTP->HTTPS redirect server"
        );

        let app = Router::new().fallback(any(move |Host(host): Host, uri: Uri| async move {
            let target = https_url(&host, &uri, https_port);
            tracing::debug!(from = %uri, to = %target, "Redirecting HTTP to HTTPS");
            Redirect::permanent(&target)
        }));

        match axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
        {
            Ok(()) => {
                tracing::debug!("HTTP redirect server stopped");
            }
            Err(e) => {
                tracing::error!(error = %e, "HTTP redirect server failed");
            }
        }
    });
}

/// HTTPS URL for the same host and path.
fn https_url(host: &str, uri: &Uri, https_port: u16) -> String {
    let host = strip_port(host);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    }
}
