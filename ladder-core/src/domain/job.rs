use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::profile::Profile;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One phase of the fixed conversion pipeline. The unit of retry,
/// progress reporting, and error classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    MetadataExtraction,
    Validation,
    Transcoding,
    SubtitlesExtraction,
    ThumbnailsGeneration,
    HlsSegmentation,
    Uploading,
    Cleanup,
}

impl Stage {
    pub fn all() -> [Stage; 8] {
        [
            Stage::MetadataExtraction,
            Stage::Validation,
            Stage::Transcoding,
            Stage::SubtitlesExtraction,
            Stage::ThumbnailsGeneration,
            Stage::HlsSegmentation,
            Stage::Uploading,
            Stage::Cleanup,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::MetadataExtraction => "METADATA_EXTRACTION",
            Stage::Validation => "VALIDATION",
            Stage::Transcoding => "TRANSCODING",
            Stage::SubtitlesExtraction => "SUBTITLES_EXTRACTION",
            Stage::ThumbnailsGeneration => "THUMBNAILS_GENERATION",
            Stage::HlsSegmentation => "HLS_SEGMENTATION",
            Stage::Uploading => "UPLOADING",
            Stage::Cleanup => "CLEANUP",
        }
    }

    /// Relative share of overall progress. The weights sum to 100.
    pub fn weight(&self) -> u32 {
        match self {
            Stage::MetadataExtraction => 5,
            Stage::Validation => 5,
            Stage::Transcoding => 50,
            Stage::SubtitlesExtraction => 5,
            Stage::ThumbnailsGeneration => 10,
            Stage::HlsSegmentation => 10,
            Stage::Uploading => 10,
            Stage::Cleanup => 5,
        }
    }

    /// Failures in a best-effort stage are recorded but never fail the job.
    pub fn best_effort(&self) -> bool {
        matches!(self, Stage::SubtitlesExtraction | Stage::ThumbnailsGeneration)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "METADATA_EXTRACTION" => Ok(Stage::MetadataExtraction),
            "VALIDATION" => Ok(Stage::Validation),
            "TRANSCODING" => Ok(Stage::Transcoding),
            "SUBTITLES_EXTRACTION" => Ok(Stage::SubtitlesExtraction),
            "THUMBNAILS_GENERATION" => Ok(Stage::ThumbnailsGeneration),
            "HLS_SEGMENTATION" => Ok(Stage::HlsSegmentation),
            "UPLOADING" => Ok(Stage::Uploading),
            "CLEANUP" => Ok(Stage::Cleanup),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Weighted overall progress: full weight of every stage before `stage`,
/// plus the proportional share of the stage in flight.
pub fn overall_progress(stage: Stage, stage_progress: u32) -> u32 {
    let stage_progress = stage_progress.min(100);
    let mut completed = 0u32;
    for s in Stage::all() {
        if s == stage {
            break;
        }
        completed += s.weight();
    }
    completed + stage.weight() * stage_progress / 100
}

/// A video conversion job. The row in `conversion_jobs` is the single
/// source of truth shared between admission, the orchestrator, and
/// status readers; writes are serialized by `lock_version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub video_id: Option<Uuid>,
    pub source_bucket: String,
    pub source_key: String,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    pub stage_progress: u32,
    pub overall_progress: u32,
    pub profile: Profile,
    pub idempotency_key: Option<String>,
    pub workflow_id: Option<String>,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub last_error_id: Option<Uuid>,
    pub lock_version: i64,
}

impl Job {
    pub fn new(source_bucket: impl Into<String>, source_key: impl Into<String>, profile: Profile) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            video_id: None,
            source_bucket: source_bucket.into(),
            source_key: source_key.into(),
            status: JobStatus::Queued,
            current_stage: None,
            stage_progress: 0,
            overall_progress: 0,
            profile,
            idempotency_key: None,
            workflow_id: None,
            priority: 0,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            attempt: 0,
            last_error_id: None,
            lock_version: 0,
        }
    }

    /// Grouping key for output object paths; falls back to the job id.
    pub fn output_group(&self) -> String {
        self.video_id.unwrap_or(self.id).to_string()
    }
}
