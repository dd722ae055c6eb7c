//! Bounded-concurrency directory mirroring.
//!
//! Walks a local tree, uploads every file under a key prefix, and emits a
//! typed `Artifact` per object. The semaphore caps in-flight uploads; a
//! single file failure fails the whole directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::domain::{Artifact, ArtifactType};

use super::{ObjectStorage, StorageError, StorageResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadProgress {
    pub total_files: usize,
    pub completed_files: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
}

pub type UploadProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

pub struct DirectoryUploader {
    storage: Arc<dyn ObjectStorage>,
    max_concurrent: usize,
}

struct PendingFile {
    local_path: PathBuf,
    key: String,
    size: u64,
}

impl DirectoryUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, max_concurrent: usize) -> Self {
        Self {
            storage,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Mirrors `local_dir` under `prefix`. Artifact order follows key
    /// order; upload completion order does not.
    pub async fn upload_directory(
        &self,
        job_id: Uuid,
        local_dir: &Path,
        bucket: &str,
        prefix: &str,
        progress_fn: Option<UploadProgressFn>,
    ) -> StorageResult<Vec<Artifact>> {
        let mut files = Vec::new();
        collect_files(local_dir, local_dir, prefix, &mut files)?;

        let total_files = files.len();
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        let completed = Arc::new(AtomicUsize::new(0));
        let uploaded = Arc::new(AtomicU64::new(0));

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<StorageResult<Artifact>> = JoinSet::new();

        for file in files {
            let storage = self.storage.clone();
            let semaphore = semaphore.clone();
            let bucket = bucket.to_string();
            let completed = completed.clone();
            let uploaded = uploaded.clone();
            let progress_fn = progress_fn.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|err| StorageError::Network(err.to_string()))?;
                let result = storage.upload(&bucket, &file.key, &file.local_path).await?;

                let artifact = Artifact::new(
                    job_id,
                    ArtifactType::from_key(&file.key),
                    bucket,
                    file.key,
                )
                .with_size(result.size)
                .with_checksum(result.etag);

                completed.fetch_add(1, Ordering::SeqCst);
                uploaded.fetch_add(file.size, Ordering::SeqCst);
                if let Some(callback) = &progress_fn {
                    callback(UploadProgress {
                        total_files,
                        completed_files: completed.load(Ordering::SeqCst),
                        total_bytes,
                        uploaded_bytes: uploaded.load(Ordering::SeqCst),
                    });
                }
                Ok(artifact)
            });
        }

        let mut artifacts = Vec::with_capacity(total_files);
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(artifact)) => artifacts.push(artifact),
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(StorageError::Network(err.to_string()));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        artifacts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(artifacts)
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    prefix: &str,
    files: &mut Vec<PendingFile>,
) -> StorageResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|source| StorageError::Io {
        source,
        path: dir.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            source,
            path: dir.to_path_buf(),
        })?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(|source| StorageError::Io {
            source,
            path: path.clone(),
        })?;
        if metadata.is_dir() {
            collect_files(root, &path, prefix, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.push(PendingFile {
                key: format!("{prefix}/{relative}"),
                local_path: path,
                size: metadata.len(),
            });
        }
    }
    Ok(())
}
