use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    HlsMaster,
    HlsVariant,
    Segment,
    Subtitle,
    ThumbTile,
    ThumbVtt,
    MetadataJson,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::HlsMaster => "HLS_MASTER",
            ArtifactType::HlsVariant => "HLS_VARIANT",
            ArtifactType::Segment => "SEGMENT",
            ArtifactType::Subtitle => "SUBTITLE",
            ArtifactType::ThumbTile => "THUMB_TILE",
            ArtifactType::ThumbVtt => "THUMB_VTT",
            ArtifactType::MetadataJson => "METADATA_JSON",
        }
    }

    /// Infers the artifact role from its object key: the master playlist
    /// by name, thumbnail VTTs by their directory, the rest by extension.
    pub fn from_key(key: &str) -> ArtifactType {
        let path = Path::new(key);
        let base = path.file_name().and_then(|n| n.to_str()).unwrap_or(key);
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let in_thumbs = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            == Some("thumbs");

        match ext {
            _ if base == "master.m3u8" => ArtifactType::HlsMaster,
            "m3u8" => ArtifactType::HlsVariant,
            "ts" | "m4s" => ArtifactType::Segment,
            "vtt" if in_thumbs => ArtifactType::ThumbVtt,
            "vtt" => ArtifactType::Subtitle,
            "jpg" | "jpeg" | "png" => ArtifactType::ThumbTile,
            "json" => ArtifactType::MetadataJson,
            _ => ArtifactType::Segment,
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HLS_MASTER" => Ok(ArtifactType::HlsMaster),
            "HLS_VARIANT" => Ok(ArtifactType::HlsVariant),
            "SEGMENT" => Ok(ArtifactType::Segment),
            "SUBTITLE" => Ok(ArtifactType::Subtitle),
            "THUMB_TILE" => Ok(ArtifactType::ThumbTile),
            "THUMB_VTT" => Ok(ArtifactType::ThumbVtt),
            "METADATA_JSON" => Ok(ArtifactType::MetadataJson),
            other => Err(format!("unknown artifact type: {other}")),
        }
    }
}

/// A durably uploaded output object. Rows are only created after the
/// object exists at `(bucket, key)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub artifact_type: ArtifactType,
    pub bucket: String,
    pub key: String,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        job_id: Uuid,
        artifact_type: ArtifactType,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            artifact_type,
            bucket: bucket.into(),
            key: key.into(),
            size_bytes: None,
            checksum: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_inference_from_keys() {
        assert_eq!(
            ArtifactType::from_key("vid/job/hls/master.m3u8"),
            ArtifactType::HlsMaster
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/hls/legacy/720p.m3u8"),
            ArtifactType::HlsVariant
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/hls/legacy/720p_00001.ts"),
            ArtifactType::Segment
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/hls/modern/720p_00001.m4s"),
            ArtifactType::Segment
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/thumbs/thumbnails.vtt"),
            ArtifactType::ThumbVtt
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/subtitles/eng.vtt"),
            ArtifactType::Subtitle
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/thumbs/tile_000.jpg"),
            ArtifactType::ThumbTile
        );
        assert_eq!(
            ArtifactType::from_key("vid/job/meta/metadata.json"),
            ArtifactType::MetadataJson
        );
    }
}
