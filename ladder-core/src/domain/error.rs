use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::Stage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Fatal,
    Retryable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Fatal => "FATAL",
            ErrorClass::Retryable => "RETRYABLE",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FATAL" => Ok(ErrorClass::Fatal),
            "RETRYABLE" => Ok(ErrorClass::Retryable),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// Closed taxonomy of conversion failure codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnsupportedFormat,
    InsufficientDisk,
    CorruptedFile,
    S3AccessDenied,
    S3NotFound,
    S3Timeout,
    FfmpegFailed,
    FfprobeFailed,
    NetworkError,
    InternalError,
    Timeout,
    Canceled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::InsufficientDisk => "INSUFFICIENT_DISK",
            ErrorCode::CorruptedFile => "CORRUPTED_FILE",
            ErrorCode::S3AccessDenied => "S3_ACCESS_DENIED",
            ErrorCode::S3NotFound => "S3_NOT_FOUND",
            ErrorCode::S3Timeout => "S3_TIMEOUT",
            ErrorCode::FfmpegFailed => "FFMPEG_FAILED",
            ErrorCode::FfprobeFailed => "FFPROBE_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Canceled => "CANCELED",
        }
    }

    /// Only store timeouts and transient network faults are worth
    /// retrying; everything else short-circuits the stage policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::S3Timeout | ErrorCode::NetworkError => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNSUPPORTED_FORMAT" => Ok(ErrorCode::UnsupportedFormat),
            "INSUFFICIENT_DISK" => Ok(ErrorCode::InsufficientDisk),
            "CORRUPTED_FILE" => Ok(ErrorCode::CorruptedFile),
            "S3_ACCESS_DENIED" => Ok(ErrorCode::S3AccessDenied),
            "S3_NOT_FOUND" => Ok(ErrorCode::S3NotFound),
            "S3_TIMEOUT" => Ok(ErrorCode::S3Timeout),
            "FFMPEG_FAILED" => Ok(ErrorCode::FfmpegFailed),
            "FFPROBE_FAILED" => Ok(ErrorCode::FfprobeFailed),
            "NETWORK_ERROR" => Ok(ErrorCode::NetworkError),
            "INTERNAL_ERROR" => Ok(ErrorCode::InternalError),
            "TIMEOUT" => Ok(ErrorCode::Timeout),
            "CANCELED" => Ok(ErrorCode::Canceled),
            other => Err(format!("unknown error code: {other}")),
        }
    }
}

/// A persisted conversion failure. The owning job's `last_error_id`
/// always points at the most recent row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionError {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
    pub details: serde_json::Value,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl ConversionError {
    pub fn new(
        job_id: Uuid,
        stage: Stage,
        code: ErrorCode,
        message: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            stage,
            class: code.class(),
            code,
            message: message.into(),
            details: serde_json::Value::Null,
            attempt,
            created_at: Utc::now(),
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
}
