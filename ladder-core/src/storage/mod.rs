//! Object storage: the S3 client and the bounded directory uploader.

pub mod s3;
pub mod uploader;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub use s3::S3Client;
pub use uploader::{DirectoryUploader, UploadProgress, UploadProgressFn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("store rejected credentials: {0}")]
    AccessDenied(String),
    #[error("store i/o deadline of {0:?} exceeded")]
    Timeout(Duration),
    #[error("store network error: {0}")]
    Network(String),
    #[error("storage io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// The storage operations stages depend on. `S3Client` is the production
/// implementation; tests substitute a filesystem-backed fake.
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Streams the object to `dest`, creating parent directories.
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StorageResult<()>;

    /// Uploads a local file; large files go through multipart upload.
    async fn upload(&self, bucket: &str, key: &str, src: &Path) -> StorageResult<UploadResult>;

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    /// Reachability probe against the output bucket.
    async fn health(&self) -> StorageResult<()>;
}

/// Content-Type by extension; unknown extensions fall back to a generic
/// binary type.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "mp4" => "video/mp4",
        "m4s" => "video/iso.segment",
        "mpd" => "application/dash+xml",
        "vtt" => "text/vtt",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_cover_artifact_extensions() {
        assert_eq!(content_type_for("a/master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("a/720p_00001.ts"), "video/mp2t");
        assert_eq!(content_type_for("a/720p.mp4"), "video/mp4");
        assert_eq!(content_type_for("a/720p_00001.m4s"), "video/iso.segment");
        assert_eq!(content_type_for("a/manifest.mpd"), "application/dash+xml");
        assert_eq!(content_type_for("a/eng.vtt"), "text/vtt");
        assert_eq!(content_type_for("a/tile_000.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a/metadata.json"), "application/json");
        assert_eq!(content_type_for("a/unknown.bin"), "application/octet-stream");
        assert_eq!(content_type_for("no-extension"), "application/octet-stream");
    }
}
