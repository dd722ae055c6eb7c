//! Ladder - adaptive-streaming conversion service
//!
//! A client submits a job referencing a source object in an
//! S3-compatible store; the pipeline probes, validates, transcodes,
//! segments, and uploads an HLS (and optionally DASH) package together
//! with thumbnails, subtitle sidecars, and a metadata record.
//!
//! Layout:
//! - `domain/`: jobs, profiles, tiers, metadata, the error taxonomy
//! - `store/`: SQLite persistence with optimistic locking
//! - `ffmpeg/`: command builder, process runner, prober, encryption
//! - `playlist/`: HLS masters, DASH MPD, thumbnail VTT
//! - `storage/`: S3 client and bounded directory uploader
//! - `pipeline/`: the orchestrator, stage activities, retry tables
//! - `workspace`: per-job scratch trees and the orphan sweep

pub mod config;
pub mod domain;
pub mod drm;
pub mod error;
pub mod ffmpeg;
pub mod pipeline;
pub mod playlist;
pub mod sqlite;
pub mod storage;
pub mod store;
pub mod workspace;

pub use config::{load_config, LadderConfig};
pub use domain::{
    Artifact, ArtifactType, ConversionError, EncodingTier, ErrorClass, ErrorCode, Job, JobStatus,
    Profile, Quality, Stage, VideoMetadata,
};
pub use error::{ConfigError, Result};
pub use ffmpeg::{CommandBuilder, CommandExecutor, Prober, Runner, SystemCommandExecutor};
pub use pipeline::{
    Activities, CancelToken, CancellationRegistry, Heartbeat, Orchestrator, PipelineError,
    PipelineResult, RetryPolicy, StageError, StageResults,
};
pub use storage::{DirectoryUploader, ObjectStorage, S3Client, StorageError};
pub use store::{SqliteJobStore, SqliteJobStoreBuilder, StoreError, StoreResult};
pub use workspace::{sweep_orphans, Workspace, WorkspaceError};
