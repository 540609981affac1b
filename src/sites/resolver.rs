//! Maps a request host and path onto a file under a document root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::INDEX_FILE;

use super::registry::DomainRegistry;

/// How a request path was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// The path named a file directly
    File,
    /// The path named a directory containing an index
    DirectoryIndex,
    /// Nothing matched; the root index is served instead (soft 404)
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Host with any port removed
    pub host: String,
    /// Document root the path was resolved against
    pub root: PathBuf,
    pub path: PathBuf,
    pub kind: ResolutionKind,
}

impl ResolvedPath {
    pub fn is_directory_index(&self) -> bool {
        self.kind == ResolutionKind::DirectoryIndex
    }
}

pub struct ContentResolver {
    sites_dir: PathBuf,
    default_root: PathBuf,
    registry: Arc<DomainRegistry>,
}

impl ContentResolver {
    pub fn new(sites_dir: PathBuf, default_root: PathBuf, registry: Arc<DomainRegistry>) -> Self {
        Self {
            sites_dir,
            default_root,
            registry,
        }
    }

    /// Resolve `request_path` for `host`, registering the host on first sight.
    ///
    /// Unmatched paths fall back to the root's `index.html`.
    pub async fn resolve(&self, host: &str, request_path: &str) -> ResolvedPath {
        let host = strip_port(host);

        if !self.registry.is_registered(host) {
            tracing::debug!(host = %host, "Request for unregistered host");
            self.registry.register(host);
        }

        let root = self.document_root(host).await;
        let relative = clean_path(request_path);

        let candidate = root.join(&relative);
        let (path, kind) = if is_file(&candidate).await {
            (candidate, ResolutionKind::File)
        } else {
            let index = candidate.join(INDEX_FILE);
            if is_file(&index).await {
                (index, ResolutionKind::DirectoryIndex)
            } else {
                (root.join(INDEX_FILE), ResolutionKind::Fallback)
            }
        };

        ResolvedPath {
            host: host.to_string(),
            root,
            path,
            kind,
        }
    }

    /// `<sites_dir>/<host>` when that directory exists, otherwise the default root.
    async fn document_root(&self, host: &str) -> PathBuf {
        if is_site_name(host) {
            let site = self.sites_dir.join(host);
            if tokio::fs::metadata(&site).await.is_ok() {
                return site;
            }
        }
        self.default_root.clone()
    }
}

/// Remove a trailing `:port` from a host header value.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal: keep everything up to the closing bracket
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Hosts that cannot name a directory under the sites root.
fn is_site_name(host: &str) -> bool {
    !host.is_empty() && host != "." && host != ".." && !host.contains(['/', '\\'])
}

/// Percent-decode a URL path and drop `.`, `..` and empty segments.
fn clean_path(request_path: &str) -> PathBuf {
    let decoded = urlencoding::decode(request_path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| request_path.to_string());

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.iter().collect()
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| !m.is_dir())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::registry::WatchPolicy;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        sites: PathBuf,
        client: PathBuf,
        registry: Arc<DomainRegistry>,
        resolver: ContentResolver,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sites = dir.path().join("sites");
        let client = dir.path().join("client");

        fs::create_dir_all(sites.join("a.test/docs")).unwrap();
        fs::create_dir_all(sites.join("a.test/empty")).unwrap();
        fs::write(sites.join("a.test/index.html"), "a root").unwrap();
        fs::write(sites.join("a.test/about.html"), "about").unwrap();
        fs::write(sites.join("a.test/docs/index.html"), "docs").unwrap();
        fs::create_dir_all(&client).unwrap();
        fs::write(client.join("index.html"), "default").unwrap();

        let (policy, _rx) = WatchPolicy::new();
        let registry = Arc::new(DomainRegistry::new(Arc::new(policy)));
        let resolver = ContentResolver::new(sites.clone(), client.clone(), registry.clone());
        Fixture {
            _dir: dir,
            sites,
            client,
            registry,
            resolver,
        }
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.test:8443"), "a.test");
        assert_eq!(strip_port("a.test"), "a.test");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port(""), "");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/"), PathBuf::new());
        assert_eq!(clean_path("/css/site.css"), PathBuf::from("css/site.css"));
        assert_eq!(clean_path("/a/./b//c/"), PathBuf::from("a/b/c"));
        assert_eq!(clean_path("/../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(clean_path("/a/b/../c"), PathBuf::from("a/c"));
        assert_eq!(clean_path("/my%20file.txt"), PathBuf::from("my file.txt"));
    }

    #[tokio::test]
    async fn test_resolves_direct_file() {
        let f = fixture();
        let resolved = f.resolver.resolve("a.test", "/about.html").await;
        assert_eq!(resolved.root, f.sites.join("a.test"));
        assert_eq!(resolved.path, f.sites.join("a.test/about.html"));
        assert_eq!(resolved.kind, ResolutionKind::File);
        assert!(!resolved.is_directory_index());
    }

    #[tokio::test]
    async fn test_resolves_directory_index() {
        let f = fixture();
        let resolved = f.resolver.resolve("a.test", "/docs").await;
        assert_eq!(resolved.path, f.sites.join("a.test/docs/index.html"));
        assert!(resolved.is_directory_index());

        let root = f.resolver.resolve("a.test", "/").await;
        assert_eq!(root.path, f.sites.join("a.test/index.html"));
        assert!(root.is_directory_index());
    }

    #[tokio::test]
    async fn test_missing_path_falls_back_to_root_index() {
        let f = fixture();
        let resolved = f.resolver.resolve("a.test", "/missing").await;
        assert_eq!(resolved.path, f.sites.join("a.test/index.html"));
        assert_eq!(resolved.kind, ResolutionKind::Fallback);

        // A directory without its own index also falls back
        let empty = f.resolver.resolve("a.test", "/empty").await;
        assert_eq!(empty.path, f.sites.join("a.test/index.html"));
        assert_eq!(empty.kind, ResolutionKind::Fallback);
    }

    #[tokio::test]
    async fn test_unknown_site_uses_default_root() {
        let f = fixture();
        let resolved = f.resolver.resolve("b.test:8080", "/about.html").await;
        assert_eq!(resolved.host, "b.test");
        assert_eq!(resolved.root, f.client);
        assert_eq!(resolved.path, f.client.join("index.html"));
    }

    #[tokio::test]
    async fn test_registers_host_without_port() {
        let f = fixture();
        assert!(!f.registry.is_registered("b.test"));
        f.resolver.resolve("b.test:8080", "/").await;
        f.resolver.resolve("b.test", "/").await;
        assert_eq!(f.registry.snapshot(), vec!["b.test"]);
        assert!(f.registry.allow_list().contains("b.test"));
    }

    #[tokio::test]
    async fn test_traversal_host_uses_default_root() {
        let f = fixture();
        let resolved = f.resolver.resolve("..", "/index.html").await;
        assert_eq!(resolved.root, f.client);

        let escaped = f.resolver.resolve("a.test", "/../../client/index.html").await;
        assert_eq!(escaped.root, f.sites.join("a.test"));
        assert_eq!(escaped.kind, ResolutionKind::Fallback);
    }
}
