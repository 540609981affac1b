use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::io;
use std::path::PathBuf;

/// Failure while serving a file. Details stay in the server log.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl AppError {
    /// Classify an error raised while fingerprinting `path`.
    pub fn from_io(path: PathBuf, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            AppError::NotFound(path)
        } else {
            AppError::Io { path, source }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Failed to serve file");
        self.status().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = AppError::from_io(
            PathBuf::from("x"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err = AppError::from_io(
            PathBuf::from("x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
