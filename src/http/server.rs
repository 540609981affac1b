//! HTTP/HTTPS server startup logic.
//!
//! Supports three TLS modes:
//! - ACME: per-domain Let's Encrypt certificates for every registered domain
//! - Manual: User-provided certificate files
//! - None: Plain HTTP

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::watch;

use crate::config::{AppConfig, TlsMode};
use crate::sites::AllowList;

use super::acme::{self, AcmeSettings, SniResolver};
use super::redirect;
use super::shutdown;

/// Server startup error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind server: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// Start the HTTP/HTTPS server based on configuration.
///
/// `allow_list` follows the domain registry and decides which hosts get ACME
/// certificates. This function blocks until the server shuts down.
pub async fn start_server(
    app: Router,
    config: &AppConfig,
    allow_list: watch::Receiver<AllowList>,
) -> Result<(), ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .map_err(|e| ServerError::TlsConfig(format!("Invalid http.host or http.port: {}", e)))?;

    let handle = Handle::new();
    let tls = &config.http.tls;

    match &tls.mode {
        TlsMode::None => {
            tracing::warn!(
                "TLS disabled - server running on plain HTTP (not recommended for production)"
            );
            start_plain_server(app, addr, handle).await
        }
        TlsMode::Manual => {
            let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) else {
                return Err(ServerError::TlsConfig(
                    "manual TLS requires cert_path and key_path".to_string(),
                ));
            };
            start_manual_tls_server(app, addr, cert_path, key_path, tls, handle).await
        }
        TlsMode::Acme => start_acme_server(app, addr, tls, allow_list, handle).await,
    }
}

/// Start a plain HTTP server (no TLS).
async fn start_plain_server(
    app: Router,
    addr: SocketAddr,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, "Starting HTTP server (no TLS)");

    shutdown::setup_shutdown_handler(handle.clone());

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))
}

/// Start HTTPS server with user-provided certificates.
async fn start_manual_tls_server(
    app: Router,
    addr: SocketAddr,
    cert_path: &str,
    key_path: &str,
    tls_config: &crate::config::TlsConfig,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, cert = %cert_path, key = %key_path, "Starting HTTPS server (manual certs)");

    let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| ServerError::TlsConfig(format!("Failed to load certificates: {}", e)))?;

    shutdown::setup_shutdown_handler(handle.clone());

    // SIGHUP reloads the certificate files
    shutdown::setup_reload_handler(rustls_config.clone(), cert_path.to_string(), key_path.to_string());

    if tls_config.redirect_http {
        redirect::spawn_redirect_server(tls_config.redirect_port, addr.port());
    }

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))
}

/// Start HTTPS server with per-domain ACME (Let's Encrypt) certificates.
async fn start_acme_server(
    app: Router,
    addr: SocketAddr,
    tls_config: &crate::config::TlsConfig,
    allow_list: watch::Receiver<AllowList>,
    handle: Handle,
) -> Result<(), ServerError> {
    let settings = AcmeSettings {
        email: tls_config.acme_email.clone(),
        cache_dir: tls_config.acme_cache_dir.clone(),
        production: tls_config.acme_production,
    };

    let env_name = if settings.production { "production" } else { "staging" };
    tracing::info!(
        %addr,
        domains = allow_list.borrow().len(),
        email = ?settings.email,
        cache = %settings.cache_dir,
        environment = %env_name,
        "Starting HTTPS server (ACME)"
    );

    if allow_list.borrow().is_empty() {
        tracing::info!("Allow-list is empty, certificates will be ordered as domains register");
    }

    if !settings.production {
        tracing::warn!(
            "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers. \
             Set acme_production = true for production use."
        );
    }

    std::fs::create_dir_all(&settings.cache_dir).map_err(|e| {
        ServerError::TlsConfig(format!(
            "Failed to create ACME cache directory '{}': {}",
            settings.cache_dir, e
        ))
    })?;

    let resolver = Arc::new(SniResolver::default());
    acme::spawn_acme_manager(settings, allow_list, resolver.clone());
    let rustls_config = RustlsConfig::from_config(Arc::new(acme::server_config(resolver)));

    shutdown::setup_shutdown_handler(handle.clone());

    if tls_config.redirect_http {
        redirect::spawn_redirect_server(tls_config.redirect_port, addr.port());
    }

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))
}
