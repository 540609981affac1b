//! Registry of every domain the server has seen.
//!
//! The registry is seeded from the persisted domain list and the configured
//! overrides, then grows whenever a request arrives for an unknown host. Each
//! insert regenerates the certificate allow-list and publishes it to the
//! [`CertificatePolicy`] while the write lock is still held, so the allow-list
//! handed to the certificate manager never lags behind the registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

/// Hosts for which the certificate manager may obtain certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(Arc<[String]>);

impl AllowList {
    /// Build the allow-list for a registry snapshot.
    pub fn from_hosts(hosts: &[String]) -> Self {
        Self(hosts.iter().cloned().collect())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.iter().any(|h| h == host)
    }

    pub fn hosts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Receives the allow-list every time the registry changes.
pub trait CertificatePolicy: Send + Sync {
    fn apply(&self, allow_list: &AllowList);
}

/// Publishes allow-lists on a watch channel for the ACME manager to follow.
pub struct WatchPolicy {
    tx: watch::Sender<AllowList>,
}

impl WatchPolicy {
    pub fn new() -> (Self, watch::Receiver<AllowList>) {
        let (tx, rx) = watch::channel(AllowList::default());
        (Self { tx }, rx)
    }
}

impl CertificatePolicy for WatchPolicy {
    fn apply(&self, allow_list: &AllowList) {
        // send_replace never fails, even with no receiver attached
        self.tx.send_replace(allow_list.clone());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to create domain list '{path}': {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read domain list '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Default)]
struct Inner {
    hosts: Vec<String>,
    index: HashSet<String>,
    allow_list: AllowList,
}

/// Ordered, duplicate-free set of known hosts.
pub struct DomainRegistry {
    inner: RwLock<Inner>,
    policy: Arc<dyn CertificatePolicy>,
}

impl DomainRegistry {
    pub fn new(policy: Arc<dyn CertificatePolicy>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policy,
        }
    }

    pub fn is_registered(&self, host: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .contains(host)
    }

    /// Add `host` if it is new. Returns whether the registry changed.
    pub fn register(&self, host: &str) -> bool {
        let host = host.trim();
        if host.is_empty() {
            tracing::warn!("Cannot use an empty string as a domain");
            return false;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.index.contains(host) {
            tracing::debug!(domain = %host, "Domain already registered");
            return false;
        }

        tracing::info!(domain = %host, "Adding domain to domain list");
        inner.hosts.push(host.to_string());
        inner.index.insert(host.to_string());
        inner.allow_list = AllowList::from_hosts(&inner.hosts);
        self.policy.apply(&inner.allow_list);
        true
    }

    /// Seed the registry from the persisted list and the override hosts.
    ///
    /// A missing list is created empty. Returns the number of registered domains.
    pub async fn load_persisted(
        &self,
        path: &Path,
        overrides: &[String],
    ) -> Result<usize, RegistryError> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::File::create(path)
                    .await
                    .map_err(|source| RegistryError::Create {
                        path: path.to_path_buf(),
                        source,
                    })?;
                tracing::info!(path = %path.display(), "Created empty domain list");
                Vec::new()
            }
            Err(source) => {
                return Err(RegistryError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let lines = contents
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.is_empty());
        for (number, line) in lines {
            match std::str::from_utf8(line) {
                Ok(host) => {
                    self.register(host);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = number + 1,
                        error = %e,
                        "Skipping undecodable domain list entry"
                    );
                }
            }
        }
        for host in overrides {
            self.register(host);
        }

        let count = self.len();
        tracing::info!(count, "Domains registered");
        Ok(count)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hosts
            .clone()
    }

    pub fn allow_list(&self) -> AllowList {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allow_list
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hosts
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
