use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Top-level service configuration. Loaded once at startup, validated,
/// and handed to stages behind an `Arc` so tests can substitute values.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LadderConfig {
    pub database: DatabaseSection,
    pub s3: S3Section,
    pub worker: WorkerSection,
    pub ffmpeg: FfmpegSection,
    pub hls: HlsSection,
    pub encoding: EncodingSection,
    #[serde(default)]
    pub thumbnails: ThumbnailsSection,
    #[serde(default)]
    pub drm: DrmSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub log: LogSection,
}

impl LadderConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.worker.workdir_root).join(path)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::Invalid("s3 credentials must be set".into()));
        }
        if self.s3.bucket_output.is_empty() {
            return Err(ConfigError::Invalid("s3.bucket_output must be set".into()));
        }
        if self.worker.max_parallel_jobs == 0
            || self.worker.max_parallel_ffmpeg == 0
            || self.worker.max_parallel_uploads == 0
        {
            return Err(ConfigError::Invalid(
                "worker parallelism caps must be at least 1".into(),
            ));
        }
        if self.hls.segment_duration_sec == 0 {
            return Err(ConfigError::Invalid(
                "hls.segment_duration_sec must be at least 1".into(),
            ));
        }
        if self.encoding.h265_crf > 51 {
            return Err(ConfigError::Invalid(
                "encoding.h265_crf must be in 0..=51".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Section {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket_output: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default = "default_s3_timeout_secs")]
    pub timeout_secs: u64,
}

impl S3Section {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub workdir_root: String,
    #[serde(default = "default_parallel_jobs")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_parallel_ffmpeg")]
    pub max_parallel_ffmpeg: usize,
    #[serde(default = "default_parallel_uploads")]
    pub max_parallel_uploads: usize,
    #[serde(default)]
    pub enable_gpu: bool,
    #[serde(default = "default_orphan_age_hours")]
    pub orphan_max_age_hours: u64,
}

impl WorkerSection {
    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.orphan_max_age_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegSection {
    #[serde(default = "default_ffmpeg_path")]
    pub binary_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
}

impl FfmpegSection {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlsSection {
    #[serde(default = "default_segment_duration")]
    pub segment_duration_sec: u32,
    #[serde(default)]
    pub enable_encryption: bool,
    /// Key delivery URL template; `{job_id}` is substituted.
    #[serde(default)]
    pub key_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodingSection {
    #[serde(default = "default_true")]
    pub enable_legacy_tier: bool,
    #[serde(default)]
    pub enable_modern_tier: bool,
    #[serde(default = "default_h265_preset")]
    pub h265_preset: String,
    #[serde(default = "default_h265_crf")]
    pub h265_crf: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailsSection {
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
}

impl Default for ThumbnailsSection {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DrmSection {
    #[serde(default)]
    pub enabled: bool,
    /// "widevine", "fairplay", "playready" or "all".
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub packager_path: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub license_url: String,
    #[serde(default)]
    pub fairplay_cert_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_retry_count")]
    pub count: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<LadderConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let config: LadderConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    config.validate()?;
    Ok(config)
}

fn default_true() -> bool {
    true
}

fn default_s3_timeout_secs() -> u64 {
    60
}

fn default_parallel_jobs() -> usize {
    2
}

fn default_parallel_ffmpeg() -> usize {
    2
}

fn default_parallel_uploads() -> usize {
    8
}

fn default_orphan_age_hours() -> u64 {
    24
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}

fn default_ffprobe_path() -> String {
    "ffprobe".into()
}

fn default_process_timeout_secs() -> u64 {
    6 * 3600
}

fn default_segment_duration() -> u32 {
    4
}

fn default_h265_preset() -> String {
    "medium".into()
}

fn default_h265_crf() -> u8 {
    26
}

fn default_max_frames() -> u32 {
    200
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [database]
            path = "/var/lib/ladder/jobs.sqlite"

            [s3]
            endpoint = "http://localhost:9000"
            region = "us-east-1"
            access_key = "minioadmin"
            secret_key = "minioadmin"
            bucket_output = "vod-output"

            [worker]
            workdir_root = "/var/tmp/ladder"

            [ffmpeg]

            [hls]

            [encoding]
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: LadderConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.hls.segment_duration_sec, 4);
        assert_eq!(config.encoding.h265_crf, 26);
        assert!(config.encoding.enable_legacy_tier);
        assert!(!config.encoding.enable_modern_tier);
        assert_eq!(config.thumbnails.max_frames, 200);
        assert_eq!(config.worker.max_parallel_uploads, 8);
        assert_eq!(config.ffmpeg.process_timeout(), Duration::from_secs(21600));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_empty_credentials() {
        let mut config: LadderConfig = toml::from_str(minimal_toml()).unwrap();
        config.s3.access_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_parallelism() {
        let mut config: LadderConfig = toml::from_str(minimal_toml()).unwrap();
        config.worker.max_parallel_jobs = 0;
        assert!(config.validate().is_err());
    }
}
