//! Gate - multi-tenant static site server
//!
//! Serves a directory of static sites keyed by host name, learns new domains from
//! incoming traffic, and keeps a certificate for every domain it has seen.

pub mod access_log;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod routes;
pub mod sites;
pub mod state;

pub use error::*;
