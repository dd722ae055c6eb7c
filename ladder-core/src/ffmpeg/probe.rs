//! Source inspection: one ffprobe call, JSON out, typed metadata in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::domain::{normalize_container, AudioTrackInfo, SubtitleTrackInfo, VideoMetadata};

use super::CommandExecutor;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("ffprobe returned non-zero status: {stderr}")]
    NonZero { stderr: String },
    #[error("invalid ffprobe payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

pub struct Prober {
    binary: PathBuf,
    timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl Prober {
    pub fn new(binary: impl Into<PathBuf>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(60),
            executor,
        }
    }

    pub async fn probe(&self, input: &Path) -> ProbeResult<VideoMetadata> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(input);

        let output = timeout(self.timeout, self.executor.run(&mut command))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|source| ProbeError::Io {
                source,
                path: input.to_path_buf(),
            })?;

        if !output.status.success() {
            return Err(ProbeError::NonZero {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        Ok(metadata_from_probe(parsed))
    }
}

fn metadata_from_probe(data: FfprobeOutput) -> VideoMetadata {
    let mut meta = VideoMetadata {
        duration_sec: data
            .format
            .duration
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        file_size: data
            .format
            .size
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        bitrate: data
            .format
            .bit_rate
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        container: normalize_container(data.format.format_name.as_deref().unwrap_or_default()),
        ..VideoMetadata::default()
    };

    for stream in data.streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                if meta.video_codec.is_empty() {
                    meta.video_codec = stream.codec_name.clone().unwrap_or_default();
                    meta.width = stream.width.unwrap_or_default();
                    meta.height = stream.height.unwrap_or_default();
                    meta.fps = parse_rate(stream.r_frame_rate.as_deref())
                        .or_else(|| parse_rate(stream.avg_frame_rate.as_deref()))
                        .unwrap_or_default();
                }
            }
            Some("audio") => {
                let codec = stream.codec_name.clone().unwrap_or_default();
                if meta.audio_codec.is_empty() {
                    meta.audio_codec = codec.clone();
                }
                meta.audio_tracks.push(AudioTrackInfo {
                    index: stream.index,
                    codec,
                    language: stream.language(),
                    channels: stream.channels.unwrap_or_default(),
                    sample_rate: stream
                        .sample_rate
                        .as_deref()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or_default(),
                    bitrate: stream
                        .bit_rate
                        .as_deref()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or_default(),
                });
            }
            Some("subtitle") => {
                meta.subtitle_tracks.push(SubtitleTrackInfo {
                    index: stream.index,
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    language: stream.language(),
                    title: stream
                        .tags
                        .as_ref()
                        .and_then(|tags| tags.title.clone())
                        .unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    meta
}

fn parse_rate(rate: Option<&str>) -> Option<f64> {
    let rate = rate?;
    if let Some((num, den)) = rate.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        rate.parse().ok()
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    sample_rate: Option<String>,
    #[serde(default)]
    tags: Option<FfprobeTags>,
}

impl FfprobeStream {
    fn language(&self) -> String {
        self.tags
            .as_ref()
            .and_then(|tags| tags.language.clone())
            .unwrap_or_else(|| "und".to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    struct CannedExecutor {
        stdout: Vec<u8>,
        code: i32,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for CannedExecutor {
        async fn run(&self, _command: &mut Command) -> std::io::Result<Output> {
            Ok(Output {
                status: ExitStatus::from_raw(self.code << 8),
                stdout: self.stdout.clone(),
                stderr: b"probe error".to_vec(),
            })
        }
    }

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "30000/1001",
                "avg_frame_rate": "30000/1001"
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "channels": 6,
                "sample_rate": "48000",
                "bit_rate": "320000",
                "tags": {"language": "eng"}
            },
            {
                "index": 2,
                "codec_name": "subrip",
                "codec_type": "subtitle",
                "tags": {"language": "fre", "title": "Forced"}
            },
            {
                "index": 3,
                "codec_name": "subrip",
                "codec_type": "subtitle"
            }
        ],
        "format": {
            "format_name": "matroska,webm",
            "duration": "632.512000",
            "size": "1073741824",
            "bit_rate": "13581312"
        }
    }"#;

    #[tokio::test]
    async fn parses_full_probe_payload() {
        let prober = Prober::new(
            "ffprobe",
            Arc::new(CannedExecutor {
                stdout: SAMPLE.as_bytes().to_vec(),
                code: 0,
            }),
        );
        let meta = prober.probe(Path::new("/tmp/in.mkv")).await.unwrap();

        assert_eq!(meta.container, "mkv");
        assert!((meta.duration_sec - 632.512).abs() < 1e-9);
        assert_eq!(meta.file_size, 1_073_741_824);
        assert_eq!(meta.video_codec, "h264");
        assert_eq!((meta.width, meta.height), (1920, 1080));
        assert!((meta.fps - 29.97).abs() < 0.01);

        assert_eq!(meta.audio_codec, "aac");
        assert_eq!(meta.audio_tracks.len(), 1);
        assert_eq!(meta.audio_tracks[0].language, "eng");
        assert_eq!(meta.audio_tracks[0].channels, 6);
        assert!(meta.needs_downmix());

        assert_eq!(meta.subtitle_tracks.len(), 2);
        assert_eq!(meta.subtitle_tracks[0].language, "fre");
        assert_eq!(meta.subtitle_tracks[0].title, "Forced");
        assert_eq!(meta.subtitle_tracks[1].language, "und");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let prober = Prober::new(
            "ffprobe",
            Arc::new(CannedExecutor {
                stdout: Vec::new(),
                code: 1,
            }),
        );
        let err = prober.probe(Path::new("/tmp/in.mkv")).await.unwrap_err();
        match err {
            ProbeError::NonZero { stderr } => assert!(stderr.contains("probe error")),
            other => panic!("expected NonZero, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_payload_is_a_parse_error() {
        let prober = Prober::new(
            "ffprobe",
            Arc::new(CannedExecutor {
                stdout: b"not json".to_vec(),
                code: 0,
            }),
        );
        let err = prober.probe(Path::new("/tmp/in.mkv")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_rate(Some("24/1")), Some(24.0));
        assert_eq!(parse_rate(Some("0/0")), None);
        assert_eq!(parse_rate(Some("25")), Some(25.0));
        assert_eq!(parse_rate(None), None);
    }
}
