//! Multi-tenant content layer.
//!
//! A request's host selects a document root under the sites directory, its path
//! resolves to a file (or the root index as a soft 404), and the file is served
//! with an ETag from the fingerprint cache. Every host seen is added to the
//! domain registry, whose allow-list drives certificate issuance.

pub mod fingerprint;
pub mod registry;
pub mod resolver;
pub mod responder;

use std::path::PathBuf;

use axum::http::StatusCode;

pub use fingerprint::{Fingerprint, FingerprintCache};
pub use registry::{AllowList, CertificatePolicy, DomainRegistry, RegistryError, WatchPolicy};
pub use resolver::{strip_port, ContentResolver, ResolutionKind, ResolvedPath};
pub use responder::{FileResponder, ServeOutcome};

/// Outcome of one request against a site, as recorded in the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub root: PathBuf,
    pub path: PathBuf,
    pub status: StatusCode,
    pub bytes: u64,
}

impl ResolvedRoute {
    pub fn new(resolved: &ResolvedPath, outcome: ServeOutcome) -> Self {
        Self {
            root: resolved.root.clone(),
            path: resolved.path.clone(),
            status: outcome.status,
            bytes: outcome.bytes,
        }
    }
}
