//! HTTP server module with TLS support.
//!
//! This module provides HTTPS server functionality with three modes:
//! - **ACME (default)**: a Let's Encrypt certificate per registered domain,
//!   following the domain registry's allow-list as it grows
//! - **Manual**: User-provided certificate and key files
//! - **None**: Plain HTTP (dev mode or behind a reverse proxy)
//!
//! The server includes:
//! - HTTP to HTTPS redirect (when TLS enabled)
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Certificate hot-reload via SIGHUP (manual mode)

mod acme;
mod redirect;
mod server;
mod shutdown;

pub use server::{start_server, ServerError};
