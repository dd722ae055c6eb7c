//! Shaka Packager wrapper for DRM-protected output.
//!
//! Produces CENC/CBCS-encrypted HLS plus a DASH MPD from the transcoded
//! renditions. Key material comes from configuration when present;
//! otherwise a raw key pair is generated for the job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::DrmSection;
use crate::domain::Quality;
use crate::ffmpeg::CommandExecutor;

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("packager binary not found at {0}")]
    NotAvailable(String),
    #[error("packager failed with status {status:?}: {output}")]
    Failed {
        status: Option<i32>,
        output: String,
    },
    #[error("packager io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DrmResult<T> = Result<T, DrmError>;

#[derive(Debug, Clone)]
pub struct PackageResult {
    pub master_path: PathBuf,
    pub mpd_path: PathBuf,
    pub output_dir: PathBuf,
    pub key_id: String,
}

pub struct DrmPackager {
    section: DrmSection,
    executor: Arc<dyn CommandExecutor>,
}

impl DrmPackager {
    pub fn new(section: DrmSection, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { section, executor }
    }

    /// The DRM path only engages when the binary actually resolves.
    pub fn is_available(&self) -> bool {
        let path = Path::new(&self.section.packager_path);
        if self.section.packager_path.is_empty() {
            return false;
        }
        if path.components().count() > 1 {
            return path.is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(path).is_file())
            })
            .unwrap_or(false)
    }

    pub async fn package(
        &self,
        inputs: &BTreeMap<Quality, PathBuf>,
        output_dir: &Path,
        job_id: Uuid,
    ) -> DrmResult<PackageResult> {
        if !self.is_available() {
            return Err(DrmError::NotAvailable(self.section.packager_path.clone()));
        }

        let (key_id, key) = self.key_material(job_id);
        let args = self.packager_args(inputs, output_dir, &key_id, &key);

        let mut command = Command::new(&self.section.packager_path);
        command.args(&args);
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(DrmError::Failed {
                status: output.status.code(),
                output: combined,
            });
        }

        Ok(PackageResult {
            master_path: output_dir.join("master.m3u8"),
            mpd_path: output_dir.join("manifest.mpd"),
            output_dir: output_dir.to_path_buf(),
            key_id,
        })
    }

    fn key_material(&self, _job_id: Uuid) -> (String, String) {
        if !self.section.key_id.is_empty() && !self.section.key.is_empty() {
            return (self.section.key_id.clone(), self.section.key.clone());
        }
        let mut key_id = [0u8; 16];
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key_id);
        rand::thread_rng().fill_bytes(&mut key);
        (hex::encode(key_id), hex::encode(key))
    }

    fn packager_args(
        &self,
        inputs: &BTreeMap<Quality, PathBuf>,
        output_dir: &Path,
        key_id: &str,
        key: &str,
    ) -> Vec<String> {
        let mut args = Vec::new();
        let audio_source = audio_reference(inputs);

        for (quality, input) in inputs {
            let video_output = output_dir.join(format!("{quality}_video.mp4"));
            args.push(format!(
                "in={},stream=video,output={},playlist_name={quality}_video.m3u8",
                input.display(),
                video_output.display()
            ));
            if Some(*quality) == audio_source {
                let audio_output = output_dir.join("audio.mp4");
                args.push(format!(
                    "in={},stream=audio,output={},playlist_name=audio.m3u8,hls_group_id=audio,hls_name=main",
                    input.display(),
                    audio_output.display()
                ));
            }
        }

        args.push("--hls_master_playlist_output".into());
        args.push(output_dir.join("master.m3u8").display().to_string());
        args.push("--mpd_output".into());
        args.push(output_dir.join("manifest.mpd").display().to_string());
        args.push("--segment_duration".into());
        args.push("4".into());
        args.push("--fragment_duration".into());
        args.push("4".into());

        args.extend(self.protection_args(key_id, key));
        args
    }

    fn protection_args(&self, key_id: &str, key: &str) -> Vec<String> {
        let keys = format!("key_id={key_id}:key={key}");
        let mut args = vec!["--enable_raw_key_encryption".to_string()];
        match self.section.provider.to_ascii_lowercase().as_str() {
            // FairPlay requires the CBCS scheme; everything else speaks CENC.
            "fairplay" => {
                args.push("--protection_scheme".into());
                args.push("cbcs".into());
                args.push("--keys".into());
                args.push(keys);
                if !self.section.license_url.is_empty() {
                    args.push("--hls_key_uri".into());
                    args.push(self.section.license_url.clone());
                }
            }
            "playready" => {
                args.push("--protection_scheme".into());
                args.push("cenc".into());
                args.push("--keys".into());
                args.push(keys);
                if !self.section.license_url.is_empty() {
                    args.push("--playready_la_url".into());
                    args.push(self.section.license_url.clone());
                }
            }
            "widevine" | "all" => {
                args.push("--protection_scheme".into());
                args.push("cenc".into());
                args.push("--keys".into());
                args.push(keys);
                args.push("--generate_static_live_mpd".into());
            }
            _ => {
                args.push("--protection_scheme".into());
                args.push("cenc".into());
                args.push("--keys".into());
                args.push(keys);
            }
        }
        args
    }
}

/// Audio is extracted once, preferring the tallest broadly-compatible
/// rung.
fn audio_reference(inputs: &BTreeMap<Quality, PathBuf>) -> Option<Quality> {
    for quality in [
        Quality::Q1080p,
        Quality::Q720p,
        Quality::Q480p,
        Quality::Q2160p,
        Quality::Q1440p,
        Quality::Q576p,
        Quality::Origin,
    ] {
        if inputs.contains_key(&quality) {
            return Some(quality);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::SystemCommandExecutor;

    fn packager(provider: &str) -> DrmPackager {
        DrmPackager::new(
            DrmSection {
                enabled: true,
                provider: provider.into(),
                packager_path: "packager".into(),
                key_id: "11111111111111111111111111111111".into(),
                key: "22222222222222222222222222222222".into(),
                license_url: String::new(),
                fairplay_cert_path: String::new(),
            },
            Arc::new(SystemCommandExecutor),
        )
    }

    fn sample_inputs() -> BTreeMap<Quality, PathBuf> {
        BTreeMap::from([
            (Quality::Q480p, PathBuf::from("/ws/transcoded/legacy/480p.mp4")),
            (Quality::Q1080p, PathBuf::from("/ws/transcoded/legacy/1080p.mp4")),
        ])
    }

    #[test]
    fn stream_descriptors_cover_video_and_one_audio() {
        let packager = packager("widevine");
        let args = packager.packager_args(
            &sample_inputs(),
            Path::new("/ws/hls"),
            "kid",
            "key",
        );
        let descriptors: Vec<&String> =
            args.iter().filter(|a| a.starts_with("in=")).collect();
        assert_eq!(descriptors.len(), 3);
        assert!(descriptors
            .iter()
            .any(|d| d.contains("stream=video") && d.contains("480p_video.m3u8")));
        // Audio is sourced from the tallest rung only.
        assert!(descriptors
            .iter()
            .any(|d| d.contains("stream=audio") && d.contains("/ws/transcoded/legacy/1080p.mp4")));
        assert!(args.contains(&"--mpd_output".to_string()));
        assert!(args.contains(&"--enable_raw_key_encryption".to_string()));
        assert!(args.contains(&"--keys".to_string()));
        assert!(args.contains(&"key_id=kid:key=key".to_string()));
    }

    #[test]
    fn fairplay_uses_cbcs() {
        let args = packager("fairplay").protection_args("kid", "key");
        let joined = args.join(" ");
        assert!(joined.contains("--protection_scheme cbcs"));
    }

    #[test]
    fn widevine_uses_cenc_with_static_mpd() {
        let args = packager("widevine").protection_args("kid", "key");
        let joined = args.join(" ");
        assert!(joined.contains("--protection_scheme cenc"));
        assert!(joined.contains("--generate_static_live_mpd"));
    }

    #[test]
    fn configured_keys_take_precedence() {
        let (key_id, key) = packager("all").key_material(Uuid::new_v4());
        assert_eq!(key_id, "11111111111111111111111111111111");
        assert_eq!(key, "22222222222222222222222222222222");
    }

    #[test]
    fn generated_keys_are_hex_pairs() {
        let mut section = DrmSection::default();
        section.provider = "all".into();
        section.packager_path = "packager".into();
        let packager = DrmPackager::new(section, Arc::new(SystemCommandExecutor));
        let (key_id, key) = packager.key_material(Uuid::new_v4());
        assert_eq!(key_id.len(), 32);
        assert_eq!(key.len(), 32);
        assert_ne!(key_id, key);
    }
}
