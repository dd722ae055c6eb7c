//! Stage-level error type carrying a code from the closed taxonomy.

use thiserror::Error;

use crate::domain::{ErrorClass, ErrorCode};
use crate::ffmpeg::encryption::EncryptionError;
use crate::ffmpeg::{FfmpegError, ProbeError};
use crate::storage::StorageError;
use crate::store::StoreError;
use crate::workspace::WorkspaceError;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
    pub details: serde_json::Value,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !self.details.is_object() {
            self.details = serde_json::json!({});
        }
        if let Some(map) = self.details.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    pub fn canceled() -> Self {
        StageError::new(ErrorCode::Canceled, "canceled")
    }
}

pub type StageResult<T> = Result<T, StageError>;

impl From<FfmpegError> for StageError {
    fn from(error: FfmpegError) -> Self {
        match error {
            FfmpegError::Failed { status, stderr } => {
                StageError::new(ErrorCode::FfmpegFailed, "transcoder exited non-zero")
                    .with_detail("status", serde_json::json!(status))
                    .with_detail("stderr", stderr)
            }
            FfmpegError::Timeout(timeout) => StageError::new(
                ErrorCode::Timeout,
                format!("subprocess exceeded wall-clock timeout of {timeout:?}"),
            ),
            FfmpegError::Canceled => StageError::canceled(),
            FfmpegError::InvalidOutput(path) => StageError::new(
                ErrorCode::FfmpegFailed,
                format!("output file missing or empty: {}", path.display()),
            ),
            other => StageError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

impl From<StorageError> for StageError {
    fn from(error: StorageError) -> Self {
        match &error {
            StorageError::NotFound { .. } => {
                StageError::new(ErrorCode::S3NotFound, error.to_string())
            }
            StorageError::Timeout(_) => StageError::new(ErrorCode::S3Timeout, error.to_string()),
            StorageError::AccessDenied(_) => {
                StageError::new(ErrorCode::S3AccessDenied, error.to_string())
            }
            StorageError::Network(_) => {
                StageError::new(ErrorCode::NetworkError, error.to_string())
            }
            StorageError::Io { .. } => StageError::new(ErrorCode::InternalError, error.to_string()),
        }
    }
}

impl From<ProbeError> for StageError {
    fn from(error: ProbeError) -> Self {
        StageError::new(ErrorCode::FfprobeFailed, error.to_string())
    }
}

impl From<WorkspaceError> for StageError {
    fn from(error: WorkspaceError) -> Self {
        StageError::new(ErrorCode::InternalError, error.to_string())
    }
}

impl From<StoreError> for StageError {
    fn from(error: StoreError) -> Self {
        StageError::new(ErrorCode::InternalError, error.to_string())
    }
}

impl From<EncryptionError> for StageError {
    fn from(error: EncryptionError) -> Self {
        StageError::new(ErrorCode::InternalError, error.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(error: serde_json::Error) -> Self {
        StageError::new(ErrorCode::InternalError, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ffmpeg_failures_map_to_taxonomy_codes() {
        let failed: StageError = FfmpegError::Failed {
            status: Some(1),
            stderr: "boom".into(),
        }
        .into();
        assert_eq!(failed.code, ErrorCode::FfmpegFailed);
        assert_eq!(failed.details["stderr"], "boom");
        assert_eq!(failed.class(), ErrorClass::Fatal);

        let timeout: StageError = FfmpegError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(timeout.code, ErrorCode::Timeout);

        let canceled: StageError = FfmpegError::Canceled.into();
        assert_eq!(canceled.code, ErrorCode::Canceled);
    }

    #[test]
    fn storage_failures_map_to_taxonomy_codes() {
        let not_found: StageError = StorageError::NotFound {
            bucket: "b".into(),
            key: "k".into(),
        }
        .into();
        assert_eq!(not_found.code, ErrorCode::S3NotFound);
        assert_eq!(not_found.class(), ErrorClass::Fatal);

        let timeout: StageError = StorageError::Timeout(Duration::from_secs(30)).into();
        assert_eq!(timeout.code, ErrorCode::S3Timeout);
        assert_eq!(timeout.class(), ErrorClass::Retryable);

        let network: StageError = StorageError::Network("reset".into()).into();
        assert_eq!(network.code, ErrorCode::NetworkError);
        assert_eq!(network.class(), ErrorClass::Retryable);
    }
}
