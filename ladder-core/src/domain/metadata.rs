use serde::{Deserialize, Serialize};

/// Metadata extracted from the source file by the prober.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoMetadata {
    /// Source duration in seconds.
    pub duration_sec: f64,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    /// Normalized container label, e.g. `matroska,webm` becomes `mkv`.
    pub container: String,
    #[serde(default)]
    pub audio_tracks: Vec<AudioTrackInfo>,
    #[serde(default)]
    pub subtitle_tracks: Vec<SubtitleTrackInfo>,
    pub file_size: u64,
}

impl VideoMetadata {
    /// True when any source audio track carries more than two channels,
    /// which forces the async resample filter during transcode.
    pub fn needs_downmix(&self) -> bool {
        self.audio_tracks.iter().any(|track| track.channels > 2)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioTrackInfo {
    pub index: u32,
    pub codec: String,
    pub language: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub bitrate: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubtitleTrackInfo {
    pub index: u32,
    pub codec: String,
    pub language: String,
    #[serde(default)]
    pub title: String,
}

const SUPPORTED_CONTAINERS: &[&str] = &["mp4", "mkv", "mov", "webm", "avi"];

const SUPPORTED_VIDEO_CODECS: &[&str] = &[
    "h264",
    "hevc",
    "h265",
    "vp8",
    "vp9",
    "av1",
    "mpeg4",
    "mpeg2video",
];

const SUPPORTED_AUDIO_CODECS: &[&str] = &[
    "aac",
    "mp3",
    "ac3",
    "eac3",
    "opus",
    "vorbis",
    "flac",
    "pcm_s16le",
    "pcm_s24le",
];

pub fn is_container_supported(container: &str) -> bool {
    SUPPORTED_CONTAINERS.contains(&container)
}

pub fn is_video_codec_supported(codec: &str) -> bool {
    SUPPORTED_VIDEO_CODECS.contains(&codec)
}

pub fn is_audio_codec_supported(codec: &str) -> bool {
    SUPPORTED_AUDIO_CODECS.contains(&codec)
}

/// ffprobe reports comma-separated format aliases; keep the first and
/// fold the matroska family into `mkv`.
pub fn normalize_container(format_name: &str) -> String {
    let first = format_name.split(',').next().unwrap_or(format_name);
    match first {
        "matroska" | "webm" => "mkv".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matroska_family_normalizes_to_mkv() {
        assert_eq!(normalize_container("matroska,webm"), "mkv");
        assert_eq!(normalize_container("webm"), "mkv");
        assert_eq!(normalize_container("mov,mp4,m4a,3gp,3g2,mj2"), "mov");
        assert_eq!(normalize_container("avi"), "avi");
    }

    #[test]
    fn allow_lists_are_closed() {
        assert!(is_container_supported("mkv"));
        assert!(!is_container_supported("ogg"));
        assert!(is_video_codec_supported("av1"));
        assert!(!is_video_codec_supported("indeo3"));
        assert!(is_audio_codec_supported("opus"));
        assert!(!is_audio_codec_supported("wmav2"));
    }

    #[test]
    fn downmix_detection() {
        let mut meta = VideoMetadata::default();
        assert!(!meta.needs_downmix());
        meta.audio_tracks.push(AudioTrackInfo {
            channels: 2,
            ..AudioTrackInfo::default()
        });
        assert!(!meta.needs_downmix());
        meta.audio_tracks.push(AudioTrackInfo {
            channels: 6,
            ..AudioTrackInfo::default()
        });
        assert!(meta.needs_downmix());
    }
}
