use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }

    /// Codec efficiency scalar applied to preset bitrates. H.265 reaches
    /// comparable quality at roughly 60% of the H.264 rate.
    pub fn bitrate_multiplier(&self) -> f64 {
        match self {
            VideoCodec::H264 => 1.0,
            VideoCodec::H265 => 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
        }
    }
}

/// Container format for HLS segments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Ts,
    Fmp4,
}

impl ContainerFormat {
    pub fn segment_extension(&self) -> &'static str {
        match self {
            ContainerFormat::Ts => ".ts",
            ContainerFormat::Fmp4 => ".m4s",
        }
    }

    pub fn needs_init_segment(&self) -> bool {
        matches!(self, ContainerFormat::Fmp4)
    }
}

/// An encoding tier bundles a codec pair with a segment container and the
/// RFC 6381 codec strings advertised in the master playlist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EncodingTier {
    /// H.264/AAC in MPEG-TS segments. Maximum device compatibility.
    Legacy,
    /// H.265/AAC in fMP4 segments. ~40% bandwidth savings.
    Modern,
}

impl EncodingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingTier::Legacy => "legacy",
            EncodingTier::Modern => "modern",
        }
    }

    pub fn config(&self) -> TierConfig {
        match self {
            EncodingTier::Legacy => TierConfig {
                tier: EncodingTier::Legacy,
                video_codec: VideoCodec::H264,
                audio_codec: AudioCodec::Aac,
                container: ContainerFormat::Ts,
                video_codec_string: "avc1.640028",
                audio_codec_string: "mp4a.40.2",
            },
            EncodingTier::Modern => TierConfig {
                tier: EncodingTier::Modern,
                video_codec: VideoCodec::H265,
                audio_codec: AudioCodec::Aac,
                container: ContainerFormat::Fmp4,
                video_codec_string: "hvc1.1.6.L120.90",
                audio_codec_string: "mp4a.40.2",
            },
        }
    }
}

impl fmt::Display for EncodingTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncodingTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(EncodingTier::Legacy),
            "modern" => Ok(EncodingTier::Modern),
            other => Err(format!("unknown encoding tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierConfig {
    pub tier: EncodingTier,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub container: ContainerFormat,
    pub video_codec_string: &'static str,
    pub audio_codec_string: &'static str,
}

impl TierConfig {
    pub fn codecs_attr(&self) -> String {
        format!("{},{}", self.video_codec_string, self.audio_codec_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_configs_match_codec_strings() {
        let legacy = EncodingTier::Legacy.config();
        assert_eq!(legacy.video_codec, VideoCodec::H264);
        assert_eq!(legacy.container, ContainerFormat::Ts);
        assert_eq!(legacy.codecs_attr(), "avc1.640028,mp4a.40.2");
        assert!(!legacy.container.needs_init_segment());

        let modern = EncodingTier::Modern.config();
        assert_eq!(modern.video_codec, VideoCodec::H265);
        assert_eq!(modern.container.segment_extension(), ".m4s");
        assert!(modern.container.needs_init_segment());
        assert_eq!(modern.codecs_attr(), "hvc1.1.6.L120.90,mp4a.40.2");
    }

    #[test]
    fn h265_saves_forty_percent() {
        assert_eq!(VideoCodec::H265.bitrate_multiplier(), 0.6);
        assert_eq!(VideoCodec::H264.bitrate_multiplier(), 1.0);
    }
}
