//! S3-compatible client with path-style addressing and multipart upload.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::S3Section;

use super::{content_type_for, ObjectInfo, ObjectStorage, StorageError, StorageResult, UploadResult};

/// Below this size a single PUT is cheaper than multipart bookkeeping.
const MIN_MULTIPART_SIZE: u64 = 5 * 1024 * 1024;
/// Preferred part size; re-chunked upward when the object would exceed
/// the 10,000-part protocol cap.
const DEFAULT_PART_SIZE: u64 = 50 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;
const PART_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    timeout: Duration,
}

impl S3Client {
    pub fn new(section: &S3Section) -> Self {
        let credentials = Credentials::new(
            section.access_key.clone(),
            section.secret_key.clone(),
            None,
            None,
            "ladder-config",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(section.region.clone()))
            .endpoint_url(section.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: section.bucket_output.clone(),
            timeout: section.timeout(),
        }
    }

    pub fn default_bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.bounded(self.client.delete_object().bucket(bucket).key(key).send())
            .await?
            .map_err(|err| StorageError::Network(err.to_string()))?;
        Ok(())
    }

    pub async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages
            .try_next()
            .await
            .map_err(|err| StorageError::Network(err.to_string()))?
        {
            for object in page.contents() {
                objects.push(ObjectInfo {
                    key: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or_default() as u64,
                    etag: object.e_tag().unwrap_or_default().to_string(),
                });
            }
        }
        Ok(objects)
    }

    async fn bounded<F, T>(&self, fut: F) -> StorageResult<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))
    }

    async fn upload_simple(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        size: u64,
    ) -> StorageResult<UploadResult> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|err| StorageError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, err),
                path: src.to_path_buf(),
            })?;
        let output = self
            .bounded(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type(content_type_for(key))
                    .content_length(size as i64)
                    .body(body)
                    .send(),
            )
            .await?
            .map_err(|err| StorageError::Network(err.to_string()))?;
        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: output.e_tag().unwrap_or_default().to_string(),
            size,
        })
    }

    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        size: u64,
    ) -> StorageResult<UploadResult> {
        let created = self
            .bounded(
                self.client
                    .create_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .content_type(content_type_for(key))
                    .send(),
            )
            .await?
            .map_err(|err| StorageError::Network(err.to_string()))?;
        let upload_id = created.upload_id().unwrap_or_default().to_string();

        match self
            .upload_parts(bucket, key, src, size, &upload_id)
            .await
        {
            Ok(parts) => {
                let completed = self
                    .bounded(
                        self.client
                            .complete_multipart_upload()
                            .bucket(bucket)
                            .key(key)
                            .upload_id(&upload_id)
                            .multipart_upload(
                                CompletedMultipartUpload::builder()
                                    .set_parts(Some(parts))
                                    .build(),
                            )
                            .send(),
                    )
                    .await?
                    .map_err(|err| StorageError::Network(err.to_string()))?;
                Ok(UploadResult {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    etag: completed.e_tag().unwrap_or_default().to_string(),
                    size,
                })
            }
            Err(err) => {
                self.abort_multipart(bucket, key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        size: u64,
        upload_id: &str,
    ) -> StorageResult<Vec<CompletedPart>> {
        let mut part_size = DEFAULT_PART_SIZE;
        if size.div_ceil(part_size) > MAX_PARTS {
            part_size = size.div_ceil(MAX_PARTS);
        }
        let part_count = size.div_ceil(part_size);

        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: src.to_path_buf(),
            })?;

        let mut parts = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count {
            let offset = (part_number - 1) * part_size;
            let current = part_size.min(size - offset);
            let mut buffer = vec![0u8; current as usize];
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: src.to_path_buf(),
                })?;
            file.read_exact(&mut buffer)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: src.to_path_buf(),
                })?;

            let mut last_error = None;
            let mut uploaded = None;
            for retry in 0..PART_RETRIES {
                let result = self
                    .bounded(
                        self.client
                            .upload_part()
                            .bucket(bucket)
                            .key(key)
                            .upload_id(upload_id)
                            .part_number(part_number as i32)
                            .body(ByteStream::from(buffer.clone()))
                            .send(),
                    )
                    .await;
                match result {
                    Ok(Ok(output)) => {
                        uploaded = Some(
                            CompletedPart::builder()
                                .part_number(part_number as i32)
                                .set_e_tag(output.e_tag().map(str::to_string))
                                .build(),
                        );
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(key, part = part_number, retry, error = %err, "part upload failed");
                        last_error = Some(StorageError::Network(err.to_string()));
                    }
                    Err(err) => {
                        warn!(key, part = part_number, retry, "part upload timed out");
                        last_error = Some(err);
                    }
                }
                // Linear backoff between part retries.
                tokio::time::sleep(Duration::from_secs(retry as u64 + 1)).await;
            }

            match uploaded {
                Some(part) => parts.push(part),
                None => {
                    return Err(last_error
                        .unwrap_or_else(|| StorageError::Network("part upload failed".into())))
                }
            }
        }

        Ok(parts)
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(bucket, key, error = %err, "failed to abort multipart upload");
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3Client {
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StorageResult<()> {
        let output = self
            .bounded(self.client.get_object().bucket(bucket).key(key).send())
            .await?
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::Network(service.to_string())
                }
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: dest.to_path_buf(),
            })?;

        let mut body = output.body;
        loop {
            let chunk = self
                .bounded(body.try_next())
                .await?
                .map_err(|err| StorageError::Network(err.to_string()))?;
            let Some(bytes) = chunk else { break };
            file.write_all(&bytes)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: dest.to_path_buf(),
                })?;
        }
        file.flush().await.map_err(|source| StorageError::Io {
            source,
            path: dest.to_path_buf(),
        })?;
        debug!(bucket, key, dest = %dest.display(), "downloaded object");
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, src: &Path) -> StorageResult<UploadResult> {
        let metadata = tokio::fs::metadata(src)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: src.to_path_buf(),
            })?;
        let size = metadata.len();
        if size < MIN_MULTIPART_SIZE {
            self.upload_simple(bucket, key, src, size).await
        } else {
            self.upload_multipart(bucket, key, src, size).await
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let result = self
            .bounded(self.client.head_object().bucket(bucket).key(key).send())
            .await?;
        Ok(result.is_ok())
    }

    async fn health(&self) -> StorageResult<()> {
        self.bounded(self.client.head_bucket().bucket(&self.bucket).send())
            .await?
            .map_err(|err| StorageError::AccessDenied(err.to_string()))?;
        Ok(())
    }
}
