//! AES-128 material for HLS segment encryption.
//!
//! The segmenter consumes a key-info sidecar of three lines: the URI
//! players will fetch, the local key file, and the IV in hex.

use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("failed to write encryption material at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type EncryptionResult<T> = Result<T, EncryptionError>;

#[derive(Debug, Clone)]
pub struct EncryptionInfo {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_path: PathBuf,
    pub key_info_path: PathBuf,
    /// URI advertised in the playlist.
    pub key_url: String,
}

impl EncryptionInfo {
    /// Generates fresh key material under `hls_dir`. The URL template may
    /// reference `{job_id}`; an empty template falls back to a relative
    /// key next to the playlists.
    pub fn generate(
        hls_dir: &Path,
        job_id: Uuid,
        key_url_template: &str,
    ) -> EncryptionResult<Self> {
        let mut key = vec![0u8; 16];
        let mut iv = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);

        let key_path = hls_dir.join("encryption.key");
        let key_info_path = hls_dir.join("encryption.keyinfo");

        let key_url = build_key_url(key_url_template, job_id);

        std::fs::write(&key_path, &key).map_err(|source| EncryptionError::Io {
            source,
            path: key_path.clone(),
        })?;

        let key_info = format!("{key_url}\n{}\n{}\n", key_path.display(), hex::encode(&iv));
        std::fs::write(&key_info_path, key_info).map_err(|source| EncryptionError::Io {
            source,
            path: key_info_path.clone(),
        })?;

        Ok(Self {
            key,
            iv,
            key_path,
            key_info_path,
            key_url,
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(&self.iv)
    }
}

fn build_key_url(template: &str, job_id: Uuid) -> String {
    if template.is_empty() {
        return "encryption.key".to_string();
    }
    template.replace("{job_id}", &job_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_key_files_and_substitutes_template() {
        let dir = tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let info = EncryptionInfo::generate(
            dir.path(),
            job_id,
            "https://keys.example.com/{job_id}/key",
        )
        .unwrap();

        assert_eq!(info.key.len(), 16);
        assert_eq!(info.iv.len(), 16);
        assert_eq!(
            info.key_url,
            format!("https://keys.example.com/{job_id}/key")
        );
        assert_eq!(std::fs::read(&info.key_path).unwrap(), info.key);

        let key_info = std::fs::read_to_string(&info.key_info_path).unwrap();
        let lines: Vec<&str> = key_info.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], info.key_url);
        assert!(lines[1].ends_with("encryption.key"));
        assert_eq!(lines[2], info.iv_hex());
    }

    #[test]
    fn empty_template_uses_relative_key() {
        let dir = tempdir().unwrap();
        let info = EncryptionInfo::generate(dir.path(), Uuid::new_v4(), "").unwrap();
        assert_eq!(info.key_url, "encryption.key");
    }
}
