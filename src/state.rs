//! Shared application state for request handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::access_log::AccessLog;
use crate::config::AppConfig;
use crate::sites::{ContentResolver, DomainRegistry, FileResponder, FingerprintCache};

/// Shared application state, cloneable across handlers via Arc-wrapped fields.
///
/// Holds the configuration, the domain registry, the resolver and responder
/// that make up the site pipeline, and the access log handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<DomainRegistry>,
    pub resolver: Arc<ContentResolver>,
    pub responder: Arc<FileResponder>,
    pub access_log: AccessLog,
}

impl AppState {
    /// Build the site pipeline around an already-seeded registry.
    pub fn new(config: AppConfig, registry: Arc<DomainRegistry>, access_log: AccessLog) -> Self {
        let cache = Arc::new(FingerprintCache::new(
            Duration::from_secs(config.sites.fingerprint_max_age_seconds),
            config.sites.recompute_lock_stripes,
        ));
        let resolver = ContentResolver::new(
            config.sites.sites_dir.clone(),
            config.sites.default_root.clone(),
            registry.clone(),
        );
        let responder = FileResponder::new(cache, Duration::from_secs(config.sites.expires_seconds));

        Self {
            config: Arc::new(config),
            registry,
            resolver: Arc::new(resolver),
            responder: Arc::new(responder),
            access_log,
        }
    }
}
