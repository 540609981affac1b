//! Access log writer.
//!
//! Handlers hand finished requests to a bounded queue and return immediately; a
//! single background task formats and appends one line per request. When the
//! queue is full the newest record is dropped and counted, so a stalled disk
//! never holds up a response.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender, TrySendError};
use axum::extract::{ConnectInfo, Request};
use axum::http::{Method, Version};
use chrono::{DateTime, FixedOffset, Local};
use tokio::io::AsyncWriteExt;

use crate::config::AccessLogConfig;
use crate::sites::ResolvedRoute;

/// Request details captured before the request is handed to the responder.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub time: DateTime<FixedOffset>,
    pub peer: Option<SocketAddr>,
    /// `X-Real-IP` header, trusted only from loopback peers
    pub real_ip: Option<String>,
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: String,
    pub version: Version,
    pub referer: String,
    pub user_agent: String,
}

impl RequestSummary {
    pub fn from_request(request: &Request, host: &str) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        Self {
            time: Local::now().fixed_offset(),
            peer: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
            real_ip: Some(header("x-real-ip")).filter(|ip| !ip.is_empty()),
            method: request.method().clone(),
            host: host.to_string(),
            path: request.uri().path().to_string(),
            query: request.uri().query().unwrap_or_default().to_string(),
            version: request.version(),
            referer: header("referer"),
            user_agent: header("user-agent"),
        }
    }

    /// Client address, preferring `X-Real-IP` when proxied from localhost.
    pub fn client_ip(&self) -> String {
        match self.peer {
            Some(peer) if peer.ip().is_loopback() => self
                .real_ip
                .clone()
                .unwrap_or_else(|| peer.ip().to_string()),
            Some(peer) => peer.ip().to_string(),
            None => "-".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub request: RequestSummary,
    pub route: ResolvedRoute,
}

impl AccessRecord {
    /// `ip - [time] "METHOD host path query proto" status bytes "referer" "user-agent"`
    pub fn format_line(&self) -> String {
        let r = &self.request;
        format!(
            "{} - [{}] \"{} {} {} {} {:?}\" {} {} \"{}\" \"{}\"",
            r.client_ip(),
            r.time.format("%d/%b/%Y:%H:%M:%S %z"),
            r.method,
            r.host,
            r.path,
            r.query,
            r.version,
            self.route.status.as_u16(),
            self.route.bytes,
            r.referer,
            r.user_agent,
        )
    }
}

/// Handle for queueing access records. Cheap to clone.
#[derive(Clone)]
pub struct AccessLog {
    tx: Sender<AccessRecord>,
    dropped: Arc<AtomicU64>,
}

impl AccessLog {
    /// Create a handle and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, Receiver<AccessRecord>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        let log = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (log, rx)
    }

    /// Open the log file for appending and start the writer task.
    pub async fn spawn(config: &AccessLogConfig) -> io::Result<Self> {
        let file = open_append(&config.path).await?;
        let (log, rx) = Self::channel(config.queue_capacity);
        let console = config.console;
        tokio::spawn(run_writer(rx, file, console));
        tracing::info!(path = %config.path.display(), console, "Access log opened");
        Ok(log)
    }

    /// Queue a record without waiting.
    pub fn record(&self, record: AccessRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "Access log queue full, dropping records");
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Access log writer stopped, record discarded");
            }
        }
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn run_writer(rx: Receiver<AccessRecord>, mut file: tokio::fs::File, console: bool) {
    while let Ok(record) = rx.recv().await {
        let line = record.format_line();
        if console {
            tracing::info!(target: "gate::access", "{}", line);
        }
        // One write per line keeps lines whole
        if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
            tracing::error!(error = %e, "Failed to write access log");
        }
    }
    tracing::debug!("Access log writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::Duration;

    fn summary(peer: &str, real_ip: Option<&str>) -> RequestSummary {
        RequestSummary {
            time: FixedOffset::west_opt(5 * 3600)
                .unwrap()
                .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
                .unwrap(),
            peer: Some(peer.parse().unwrap()),
            real_ip: real_ip.map(String::from),
            method: Method::GET,
            host: "a.test".to_string(),
            path: "/docs/".to_string(),
            query: "v=2".to_string(),
            version: Version::HTTP_11,
            referer: "https://b.test/".to_string(),
            user_agent: "curl/8.0".to_string(),
        }
    }

    fn record(peer: &str) -> AccessRecord {
        AccessRecord {
            request: summary(peer, None),
            route: ResolvedRoute {
                root: PathBuf::from("sites/a.test"),
                path: PathBuf::from("sites/a.test/docs/index.html"),
                status: StatusCode::OK,
                bytes: 512,
            },
        }
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            record("203.0.113.9:51000").format_line(),
            "203.0.113.9 - [09/Mar/2024:14:05:07 -0500] \"GET a.test /docs/ v=2 HTTP/1.1\" 200 512 \"https://b.test/\" \"curl/8.0\""
        );
    }

    #[test]
    fn test_client_ip_uses_real_ip_from_loopback_only() {
        assert_eq!(summary("127.0.0.1:9000", Some("198.51.100.7")).client_ip(), "198.51.100.7");
        assert_eq!(summary("[::1]:9000", Some("198.51.100.7")).client_ip(), "198.51.100.7");
        assert_eq!(summary("127.0.0.1:9000", None).client_ip(), "127.0.0.1");
        assert_eq!(summary("203.0.113.9:1", Some("198.51.100.7")).client_ip(), "203.0.113.9");
    }

    #[test]
    fn test_summary_from_request() {
        let mut request = Request::builder()
            .uri("/path?q=1")
            .header("user-agent", "test-agent")
            .header("x-real-ip", "198.51.100.7")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        let summary = RequestSummary::from_request(&request, "a.test");
        assert_eq!(summary.path, "/path");
        assert_eq!(summary.query, "q=1");
        assert_eq!(summary.user_agent, "test-agent");
        assert_eq!(summary.referer, "");
        assert_eq!(summary.client_ip(), "198.51.100.7");
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (log, rx) = AccessLog::channel(1);
        log.record(record("203.0.113.9:1"));
        log.record(record("203.0.113.10:1"));

        assert_eq!(log.dropped(), 1);
        assert_eq!(rx.len(), 1);
        let kept = rx.try_recv().unwrap();
        assert_eq!(kept.request.client_ip(), "203.0.113.9");
    }

    #[tokio::test]
    async fn test_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = AccessLogConfig {
            path: dir.path().join("access.log"),
            console: false,
            queue_capacity: 8,
        };
        std::fs::write(&config.path, "existing\n").unwrap();

        let log = AccessLog::spawn(&config).await.unwrap();
        log.record(record("203.0.113.9:1"));
        log.record(record("203.0.113.10:1"));

        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&config.path).unwrap();
            if contents.lines().count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");
        assert!(lines[1].starts_with("203.0.113.9 - ["));
        assert!(lines[2].starts_with("203.0.113.10 - ["));
    }
}
