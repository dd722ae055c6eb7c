use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named quality preset. `Origin` preserves the source resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quality {
    #[serde(rename = "480p")]
    Q480p,
    #[serde(rename = "576p")]
    Q576p,
    #[serde(rename = "720p")]
    Q720p,
    #[serde(rename = "1080p")]
    Q1080p,
    #[serde(rename = "1440p")]
    Q1440p,
    #[serde(rename = "2160p")]
    Q2160p,
    #[serde(rename = "origin")]
    Origin,
}

/// Encoding parameters for one quality rung. Bitrates in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Q480p => "480p",
            Quality::Q576p => "576p",
            Quality::Q720p => "720p",
            Quality::Q1080p => "1080p",
            Quality::Q1440p => "1440p",
            Quality::Q2160p => "2160p",
            Quality::Origin => "origin",
        }
    }

    pub fn params(&self) -> Option<QualityParams> {
        let params = match self {
            Quality::Q480p => QualityParams {
                width: 854,
                height: 480,
                video_bitrate_kbps: 1_500,
                max_bitrate_kbps: 2_000,
                bufsize_kbps: 3_000,
                audio_bitrate_kbps: 128,
            },
            Quality::Q576p => QualityParams {
                width: 1024,
                height: 576,
                video_bitrate_kbps: 2_000,
                max_bitrate_kbps: 2_500,
                bufsize_kbps: 4_000,
                audio_bitrate_kbps: 128,
            },
            Quality::Q720p => QualityParams {
                width: 1280,
                height: 720,
                video_bitrate_kbps: 3_000,
                max_bitrate_kbps: 4_000,
                bufsize_kbps: 6_000,
                audio_bitrate_kbps: 192,
            },
            Quality::Q1080p => QualityParams {
                width: 1920,
                height: 1080,
                video_bitrate_kbps: 6_000,
                max_bitrate_kbps: 8_000,
                bufsize_kbps: 12_000,
                audio_bitrate_kbps: 256,
            },
            Quality::Q1440p => QualityParams {
                width: 2560,
                height: 1440,
                video_bitrate_kbps: 10_000,
                max_bitrate_kbps: 12_000,
                bufsize_kbps: 20_000,
                audio_bitrate_kbps: 256,
            },
            Quality::Q2160p => QualityParams {
                width: 3840,
                height: 2160,
                video_bitrate_kbps: 15_000,
                max_bitrate_kbps: 20_000,
                bufsize_kbps: 30_000,
                audio_bitrate_kbps: 320,
            },
            Quality::Origin => return None,
        };
        Some(params)
    }

    /// Drops every rung taller than the source. Never upscales; an empty
    /// result collapses to `[Origin]` so the job still has one output.
    pub fn filter_for_resolution(qualities: &[Quality], source_height: u32) -> Vec<Quality> {
        let mut filtered: Vec<Quality> = qualities
            .iter()
            .copied()
            .filter(|q| match q.params() {
                Some(params) => source_height >= params.height,
                None => true,
            })
            .collect();
        if filtered.is_empty() && !qualities.is_empty() {
            filtered.push(Quality::Origin);
        }
        filtered
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "480p" => Ok(Quality::Q480p),
            "576p" => Ok(Quality::Q576p),
            "720p" => Ok(Quality::Q720p),
            "1080p" => Ok(Quality::Q1080p),
            "1440p" => Ok(Quality::Q1440p),
            "2160p" => Ok(Quality::Q2160p),
            "origin" => Ok(Quality::Origin),
            other => Err(format!("unknown quality: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HlsParams {
    #[serde(default = "default_segment_duration")]
    pub segment_duration_sec: u32,
    #[serde(default = "default_playlist_type")]
    pub playlist_type: String,
}

impl Default for HlsParams {
    fn default() -> Self {
        Self {
            segment_duration_sec: default_segment_duration(),
            playlist_type: default_playlist_type(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThumbnailParams {
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    #[serde(default = "default_tile")]
    pub tile_x: u32,
    #[serde(default = "default_tile")]
    pub tile_y: u32,
    #[serde(default = "default_thumb_width")]
    pub width: u32,
    #[serde(default = "default_thumb_height")]
    pub height: u32,
}

impl Default for ThumbnailParams {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            tile_x: default_tile(),
            tile_y: default_tile(),
            width: default_thumb_width(),
            height: default_thumb_height(),
        }
    }
}

/// Intro clip prepended to every rendition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntroParams {
    pub s3_key: String,
    #[serde(default)]
    pub scale_mode: String,
}

/// A/V sync parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AlgorithmParams {
    #[serde(default)]
    pub fps: f64,
    #[serde(default = "default_gop")]
    pub gop: u32,
    #[serde(default = "default_aresample")]
    pub aresample_async: u32,
}

impl Default for AlgorithmParams {
    fn default() -> Self {
        Self {
            fps: 0.0,
            gop: default_gop(),
            aresample_async: default_aresample(),
        }
    }
}

/// Desired output shape for a job. Immutable for the job's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub qualities: Vec<Quality>,
    #[serde(default)]
    pub hls: HlsParams,
    #[serde(default)]
    pub thumbnails: ThumbnailParams,
    #[serde(default)]
    pub intro: Option<IntroParams>,
    #[serde(default)]
    pub algorithm: AlgorithmParams,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            qualities: vec![Quality::Q480p, Quality::Q720p, Quality::Q1080p],
            hls: HlsParams::default(),
            thumbnails: ThumbnailParams::default(),
            intro: None,
            algorithm: AlgorithmParams::default(),
        }
    }
}

impl Profile {
    /// Requested qualities, falling back to the default ladder when the
    /// submission left the list empty.
    pub fn effective_qualities(&self) -> Vec<Quality> {
        if self.qualities.is_empty() {
            Profile::default().qualities
        } else {
            self.qualities.clone()
        }
    }
}

fn default_segment_duration() -> u32 {
    4
}

fn default_playlist_type() -> String {
    "vod".into()
}

fn default_max_frames() -> u32 {
    200
}

fn default_tile() -> u32 {
    5
}

fn default_thumb_width() -> u32 {
    160
}

fn default_thumb_height() -> u32 {
    90
}

fn default_gop() -> u32 {
    48
}

fn default_aresample() -> u32 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_upscale_filter_drops_tall_rungs() {
        let requested = vec![Quality::Q480p, Quality::Q720p, Quality::Q1080p];
        let filtered = Quality::filter_for_resolution(&requested, 720);
        assert_eq!(filtered, vec![Quality::Q480p, Quality::Q720p]);
    }

    #[test]
    fn all_rungs_filtered_collapses_to_origin() {
        let requested = vec![Quality::Q720p, Quality::Q1080p];
        let filtered = Quality::filter_for_resolution(&requested, 360);
        assert_eq!(filtered, vec![Quality::Origin]);
    }

    #[test]
    fn origin_survives_any_resolution() {
        let requested = vec![Quality::Origin, Quality::Q2160p];
        let filtered = Quality::filter_for_resolution(&requested, 480);
        assert_eq!(filtered, vec![Quality::Origin]);
    }

    #[test]
    fn empty_request_stays_empty() {
        assert!(Quality::filter_for_resolution(&[], 1080).is_empty());
    }

    #[test]
    fn empty_qualities_fall_back_to_default_ladder() {
        let profile = Profile {
            qualities: Vec::new(),
            ..Profile::default()
        };
        assert_eq!(
            profile.effective_qualities(),
            vec![Quality::Q480p, Quality::Q720p, Quality::Q1080p]
        );
    }

    #[test]
    fn quality_serializes_with_lowercase_labels() {
        let json = serde_json::to_string(&Quality::Q1080p).unwrap();
        assert_eq!(json, "\"1080p\"");
        let parsed: Quality = serde_json::from_str("\"origin\"").unwrap();
        assert_eq!(parsed, Quality::Origin);
    }
}
