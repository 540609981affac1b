//! Per-domain ACME certificates driven by the domain registry.
//!
//! The registry publishes its allow-list on a watch channel. For every host that
//! appears on it, an ACME state machine is started for that host alone and its
//! resolver is added to [`SniResolver`]. Handshakes are dispatched by SNI name,
//! so a host whose order fails never affects certificates for other hosts.
//! TLS-ALPN-01 challenges are answered by the same per-host resolver.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use futures::StreamExt;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeConfig, ResolvesServerCertAcme};
use tokio::sync::watch;

use crate::sites::AllowList;

/// ALPN protocol used by TLS-ALPN-01 validation
const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Certificate resolver selecting the ACME resolver of the requested host.
#[derive(Debug, Default)]
pub struct SniResolver {
    hosts: RwLock<HashMap<String, Arc<ResolvesServerCertAcme>>>,
}

impl SniResolver {
    /// Host names are matched case-insensitively, like SNI.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&host.to_ascii_lowercase())
    }

    fn insert(&self, host: &str, resolver: Arc<ResolvesServerCertAcme>) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_ascii_lowercase(), resolver);
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_ascii_lowercase();
        let resolver = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();

        match resolver {
            Some(resolver) => resolver.resolve(client_hello),
            None => {
                tracing::debug!(sni = %name, "No certificate for unregistered host");
                None
            }
        }
    }
}

/// ACME account settings shared by every per-host state.
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub email: Option<String>,
    pub cache_dir: String,
    pub production: bool,
}

/// rustls server config resolving certificates through `resolver`.
pub fn server_config(resolver: Arc<SniResolver>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![
        b"h2".to_vec(),
        b"http/1.1".to_vec(),
        ACME_TLS_ALPN_NAME.to_vec(),
    ];
    config
}

/// Follow the allow-list, starting an ACME state for each newly allowed host.
pub fn spawn_acme_manager(
    settings: AcmeSettings,
    mut allow_list: watch::Receiver<AllowList>,
    resolver: Arc<SniResolver>,
) {
    tokio::spawn(async move {
        loop {
            let hosts = allow_list.borrow_and_update().clone();
            for host in hosts.hosts() {
                if resolver.contains(host) {
                    continue;
                }
                if !is_certifiable(host) {
                    tracing::debug!(domain = %host, "Skipping certificate for non-DNS host");
                    continue;
                }
                start_host(host, &settings, &resolver);
            }

            if allow_list.changed().await.is_err() {
                tracing::debug!("Allow-list channel closed, ACME manager stopping");
                break;
            }
        }
    });
}

fn start_host(host: &str, settings: &AcmeSettings, resolver: &SniResolver) {
    let mut config = AcmeConfig::new([host])
        .cache(DirCache::new(settings.cache_dir.clone()))
        .directory_lets_encrypt(settings.production);
    if let Some(email) = &settings.email {
        config = config.contact_push(format!("mailto:{}", email));
    }

    let mut state = config.state();
    resolver.insert(host, state.resolver());
    tracing::info!(domain = %host, "Started certificate management");

    let domain = host.to_string();
    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => {
                    tracing::info!(domain = %domain, event = ?event, "ACME event");
                }
                Some(Err(err)) => {
                    tracing::error!(domain = %domain, error = %err, "ACME error");
                }
                None => {
                    tracing::debug!(domain = %domain, "ACME state stream ended");
                    break;
                }
            }
        }
    });
}

/// Certificates can only be issued for DNS names.
fn is_certifiable(host: &str) -> bool {
    !host.starts_with('[') && host.parse::<IpAddr>().is_err() && host.contains('.')
}
