//! Serves resolved files with ETag validation.
//!
//! The fingerprint cache decides the validator; a request whose `If-None-Match`
//! equals it gets a 304 without the file being opened. Everything else is handed
//! to `tower_http::services::ServeFile`, which streams the body and honors range
//! requests, with the caching headers set here on top.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{
    body::Body,
    extract::Request,
    http::{
        header::{
            HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPIRES,
            IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED,
        },
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::config::{CACHE_CONTROL_STATIC, INDEX_FILE};
use crate::error::AppError;

use super::fingerprint::{Fingerprint, FingerprintCache};

/// What was sent, for the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOutcome {
    pub status: StatusCode,
    pub bytes: u64,
}

pub struct FileResponder {
    cache: Arc<FingerprintCache>,
    expires: Duration,
}

impl FileResponder {
    pub fn new(cache: Arc<FingerprintCache>, expires: Duration) -> Self {
        Self { cache, expires }
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Serve `path` for `request`.
    pub async fn serve(&self, path: &Path, mut request: Request) -> (Response, ServeOutcome) {
        let path = directory_index(path);

        let fingerprint = match self.cache.get_or_refresh(&path).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                let err = AppError::from_io(path, e);
                let outcome = ServeOutcome {
                    status: err.status(),
                    bytes: 0,
                };
                return (err.into_response(), outcome);
            }
        };

        if not_modified(request.headers(), &fingerprint) {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            self.set_caching_headers(response.headers_mut(), &path, &fingerprint);
            let outcome = ServeOutcome {
                status: StatusCode::NOT_MODIFIED,
                bytes: 0,
            };
            return (response, outcome);
        }

        // A present but stale If-None-Match wins over the date preconditions
        if request.headers().contains_key(IF_NONE_MATCH) {
            let headers = request.headers_mut();
            headers.remove(IF_MODIFIED_SINCE);
            headers.remove(IF_UNMODIFIED_SINCE);
        }

        let response = match ServeFile::new(&path).oneshot(request).await {
            Ok(response) => response.map(Body::new),
            Err(never) => match never {},
        };
        let (mut parts, body) = response.into_parts();

        let status = parts.status;
        let bytes = match status {
            StatusCode::OK => fingerprint.size,
            StatusCode::PARTIAL_CONTENT => parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            _ => 0,
        };
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            self.set_caching_headers(&mut parts.headers, &path, &fingerprint);
        }

        (Response::from_parts(parts, body), ServeOutcome { status, bytes })
    }

    fn set_caching_headers(&self, headers: &mut HeaderMap, path: &Path, fingerprint: &Fingerprint) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            headers.insert(CONTENT_TYPE, value);
        }
        headers
            .entry(CACHE_CONTROL)
            .or_insert(HeaderValue::from_static(CACHE_CONTROL_STATIC));
        if let Ok(value) = HeaderValue::from_str(&http_date(fingerprint.modified)) {
            headers.insert(LAST_MODIFIED, value);
        }
        if let Ok(value) = HeaderValue::from_str(&http_date(SystemTime::now() + self.expires)) {
            headers.insert(EXPIRES, value);
        }
        if let Ok(value) = HeaderValue::from_str(&fingerprint.validator) {
            headers.insert(ETAG, value);
        }
    }
}

/// A path ending in `/` names its folder's index.
fn directory_index(path: &Path) -> PathBuf {
    if path.as_os_str().to_string_lossy().ends_with('/') {
        path.join(INDEX_FILE)
    } else {
        path.to_path_buf()
    }
}

fn not_modified(headers: &HeaderMap, fingerprint: &Fingerprint) -> bool {
    headers
        .get(IF_NONE_MATCH)
        .is_some_and(|v| v.as_bytes() == fingerprint.validator.as_bytes())
}

/// Format a timestamp as an HTTP date (IMF-fixdate).
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::RANGE;
    use std::fs;

    fn responder() -> FileResponder {
        FileResponder::new(
            Arc::new(FingerprintCache::new(Duration::from_secs(900), 1)),
            Duration::from_secs(3600),
        )
    }

    fn get(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_serves_full_body_with_caching_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        fs::write(&path, "<p>hello</p>").unwrap();

        let (response, outcome) = responder().serve(&path, get(&[])).await;
        assert_eq!(outcome, ServeOutcome { status: StatusCode::OK, bytes: 12 });
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers().clone();
        assert_eq!(headers[CONTENT_TYPE], "text/html");
        assert_eq!(headers[CACHE_CONTROL], "public");
        assert!(headers[ETAG].to_str().unwrap().starts_with("\"sha256-"));
        assert!(headers[LAST_MODIFIED].to_str().unwrap().ends_with(" GMT"));
        assert!(headers.contains_key(EXPIRES));
        assert_eq!(body_bytes(response).await, b"<p>hello</p>");
    }

    #[tokio::test]
    async fn test_matching_validator_returns_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js");
        fs::write(&path, "let x = 1;").unwrap();

        let responder = responder();
        let (first, _) = responder.serve(&path, get(&[])).await;
        let etag = first.headers()[ETAG].to_str().unwrap().to_string();

        let (response, outcome) = responder
            .serve(&path, get(&[("if-none-match", etag.as_str())]))
            .await;
        assert_eq!(outcome, ServeOutcome { status: StatusCode::NOT_MODIFIED, bytes: 0 });
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[ETAG], etag.as_str());
        assert!(body_bytes(response).await.is_empty());
        assert_eq!(responder.cache().recomputations(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_validator_returns_full_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js");
        fs::write(&path, "let x = 1;").unwrap();

        let (response, outcome) = responder()
            .serve(&path, get(&[("if-none-match", "\"sha256-stale\"")]))
            .await;
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.bytes, 10);
        assert!(response.headers().contains_key(ETAG));
        assert_eq!(body_bytes(response).await, b"let x = 1;");
    }

    #[tokio::test]
    async fn test_mismatched_validator_overrides_if_modified_since() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js");
        fs::write(&path, "let x = 2;").unwrap();

        let (response, outcome) = responder()
            .serve(
                &path,
                get(&[
                    ("if-none-match", "\"sha256-old\""),
                    ("if-modified-since", "Fri, 01 Jan 2100 00:00:00 GMT"),
                ]),
            )
            .await;
        assert_eq!(outcome, ServeOutcome { status: StatusCode::OK, bytes: 10 });
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[ETAG].to_str().unwrap().starts_with("\"sha256-"));
        assert_eq!(body_bytes(response).await, b"let x = 2;");
    }

    #[tokio::test]
    async fn test_date_revalidation_keeps_caching_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js");
        fs::write(&path, "let x = 3;").unwrap();

        let (response, outcome) = responder()
            .serve(&path, get(&[("if-modified-since", "Fri, 01 Jan 2100 00:00:00 GMT")]))
            .await;
        assert_eq!(outcome, ServeOutcome { status: StatusCode::NOT_MODIFIED, bytes: 0 });
        let headers = response.headers();
        assert!(headers.contains_key(ETAG));
        assert!(headers.contains_key(LAST_MODIFIED));
        assert!(headers.contains_key(EXPIRES));
    }

    #[tokio::test]
    async fn test_caller_cache_control_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.css");
        fs::write(&path, "a{}").unwrap();

        let responder = responder();
        let fingerprint = responder.cache().get_or_refresh(&path).await.unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        responder.set_caching_headers(&mut headers, &path, &fingerprint);
        assert_eq!(headers[CACHE_CONTROL], "no-store");
        assert_eq!(headers[CONTENT_TYPE], "text/css");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (response, outcome) = responder()
            .serve(&dir.path().join("missing.html"), get(&[]))
            .await;
        assert_eq!(outcome, ServeOutcome { status: StatusCode::NOT_FOUND, bytes: 0 });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_path_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be read as a file
        let sub = dir.path().join("folder");
        fs::create_dir(&sub).unwrap();

        let (response, outcome) = responder().serve(&sub, get(&[])).await;
        assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_trailing_slash_serves_folder_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "root").unwrap();
        let path = PathBuf::from(format!("{}/", dir.path().display()));

        let (response, outcome) = responder().serve(&path, get(&[])).await;
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"root");
    }

    #[tokio::test]
    async fn test_range_request_reports_partial_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "0123456789").unwrap();

        let (response, outcome) = responder()
            .serve(&path, get(&[(RANGE.as_str(), "bytes=2-5")]))
            .await;
        assert_eq!(outcome, ServeOutcome { status: StatusCode::PARTIAL_CONTENT, bytes: 4 });
        assert_eq!(body_bytes(response).await, b"2345");
    }

    #[test]
    fn test_http_date_format() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
