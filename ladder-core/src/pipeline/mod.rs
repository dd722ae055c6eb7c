//! The conversion orchestrator: a durable, resumable state machine over
//! the fixed stage pipeline.
//!
//! Durability comes from the job row itself: `current_stage`, progress,
//! and a per-stage result blob are persisted after every completed
//! stage, so a restarted worker fast-forwards to the first unfinished
//! stage. Retries are table-driven per stage, cancellation is observed
//! between stages and inside subprocess waits, and a watchdog fails any
//! attempt whose heartbeat goes stale.

pub mod cancel;
mod error;
pub mod retry;
pub mod stages;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::LadderConfig;
use crate::domain::{ConversionError, ErrorCode, Job, JobStatus, Stage, VideoMetadata};
use crate::ffmpeg::CommandExecutor;
use crate::storage::ObjectStorage;
use crate::store::{SqliteJobStore, StoreError};
use crate::workspace::Workspace;

pub use cancel::{CancelToken, CancellationRegistry};
pub use error::{StageError, StageResult};
pub use retry::RetryPolicy;
pub use stages::{Activities, HlsOutput, SubtitlesOutput, ThumbnailsOutput, TranscodeOutput};

const WATCHDOG_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Liveness signal shared between a stage attempt and its watchdog.
#[derive(Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn beat(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Small serializable values handed from one stage to the next and
/// persisted on the job row for resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResults {
    #[serde(default)]
    pub completed: Vec<Stage>,
    pub metadata: Option<VideoMetadata>,
    pub transcode: Option<TranscodeOutput>,
    pub subtitles: Option<SubtitlesOutput>,
    pub thumbnails: Option<ThumbnailsOutput>,
    pub hls: Option<HlsOutput>,
    pub artifact_count: Option<usize>,
}

impl StageResults {
    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    fn mark(&mut self, stage: Stage) {
        if !self.completed.contains(&stage) {
            self.completed.push(stage);
        }
    }
}

enum Supervised<T> {
    Finished(StageResult<T>),
    AttemptTimeout,
    HeartbeatStale,
}

pub struct Orchestrator {
    config: Arc<LadderConfig>,
    store: SqliteJobStore,
    activities: Activities,
    cancellations: CancellationRegistry,
    /// Slot bound for subprocess-heavy stages across all jobs on this
    /// worker (`worker.max_parallel_ffmpeg`).
    ffmpeg_slots: Arc<tokio::sync::Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<LadderConfig>,
        store: SqliteJobStore,
        storage: Arc<dyn ObjectStorage>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let activities = Activities::new(config.clone(), store.clone(), storage, executor);
        let ffmpeg_slots = Arc::new(tokio::sync::Semaphore::new(
            config.worker.max_parallel_ffmpeg.max(1),
        ));
        Self {
            config,
            store,
            activities,
            cancellations: CancellationRegistry::new(),
            ffmpeg_slots,
        }
    }

    pub fn with_cancellations(mut self, cancellations: CancellationRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Drives one job to a terminal status. Resumes after the last
    /// completed stage when prior results are on the row.
    pub async fn run_job(&self, job_id: Uuid) -> PipelineResult<JobStatus> {
        let job = self
            .store
            .get(job_id)?
            .ok_or(PipelineError::JobNotFound(job_id))?;
        if job.status.terminal() {
            return Ok(job.status);
        }

        let workflow_id = format!("run-{}", Uuid::new_v4().simple());
        self.store.set_workflow_id(job_id, &workflow_id)?;
        self.store.set_started(job_id)?;

        let workspace = Workspace::new(&self.config.worker.workdir_root, job_id);
        let heartbeat = Heartbeat::new();
        let cancel = self.cancellations.token(job_id);
        let mut results: StageResults = self
            .store
            .load_stage_results(job_id)?
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        if !results.completed.is_empty() {
            info!(job_id = %job_id, resumed_after = ?results.completed.last(), "resuming pipeline");
        }

        let outcome = self
            .execute_stages(&job, &workspace, &cancel, &heartbeat, &mut results)
            .await;

        let status = match outcome {
            Ok(()) => JobStatus::Completed,
            Err(stage_err) if stage_err.code == ErrorCode::Canceled => {
                let current = self
                    .store
                    .get(job_id)?
                    .and_then(|j| j.current_stage)
                    .unwrap_or(Stage::MetadataExtraction);
                let mut conv =
                    ConversionError::new(job_id, current, ErrorCode::Canceled, "job canceled", job.attempt);
                conv.details = stage_err.details.clone();
                if let Err(err) = self.store.record_error(&conv) {
                    warn!(job_id = %job_id, error = %err, "failed to record cancellation error");
                }
                self.run_cleanup(&job, &workspace, &heartbeat).await;
                JobStatus::Canceled
            }
            Err(stage_err) => {
                error!(job_id = %job_id, code = %stage_err.code, error = %stage_err, "pipeline failed");
                self.run_cleanup(&job, &workspace, &heartbeat).await;
                JobStatus::Failed
            }
        };

        self.finalize(job_id, status);
        Ok(status)
    }

    /// Finalization always runs, even on failure and cancel paths.
    fn finalize(&self, job_id: Uuid, status: JobStatus) {
        if let Err(err) = self.store.set_finished(job_id, status) {
            error!(job_id = %job_id, error = %err, "failed to finalize job status");
        }
        self.cancellations.remove(job_id);
        info!(job_id = %job_id, status = %status, "job finished");
    }

    /// Cleanup on the failure and cancel paths runs outside any
    /// cancelable scope so the workspace always comes down.
    async fn run_cleanup(&self, job: &Job, workspace: &Workspace, heartbeat: &Heartbeat) {
        if let Err(err) = self.activities.cleanup(job, workspace, heartbeat).await {
            warn!(job_id = %job.id, error = %err, "cleanup after termination failed");
        }
    }

    async fn execute_stages(
        &self,
        job: &Job,
        workspace: &Workspace,
        cancel: &CancelToken,
        heartbeat: &Heartbeat,
        results: &mut StageResults,
    ) -> Result<(), StageError> {
        // Metadata extraction.
        if !results.is_completed(Stage::MetadataExtraction) {
            let metadata = self
                .run_stage(job, Stage::MetadataExtraction, heartbeat, || {
                    self.activities.extract_metadata(job, workspace, heartbeat)
                })
                .await?;
            results.metadata = Some(metadata);
            results.mark(Stage::MetadataExtraction);
            self.persist_results(job.id, results);
        }
        self.check_cancel(job.id)?;

        let metadata = results
            .metadata
            .clone()
            .ok_or_else(|| StageError::new(ErrorCode::InternalError, "metadata result missing"))?;

        // Validation.
        if !results.is_completed(Stage::Validation) {
            self.run_stage(job, Stage::Validation, heartbeat, || {
                self.activities.validate(job, &metadata, heartbeat)
            })
            .await?;
            results.mark(Stage::Validation);
            self.persist_results(job.id, results);
        }
        self.check_cancel(job.id)?;

        // Transcoding. Bounded by the worker-wide ffmpeg slot count.
        if !results.is_completed(Stage::Transcoding) {
            let _slot = self.acquire_ffmpeg_slot().await?;
            let transcode = self
                .run_stage(job, Stage::Transcoding, heartbeat, || {
                    self.activities
                        .transcode(job, &metadata, workspace, cancel, heartbeat)
                })
                .await?;
            results.transcode = Some(transcode);
            results.mark(Stage::Transcoding);
            self.persist_results(job.id, results);
        }
        self.check_cancel(job.id)?;

        let transcode = results
            .transcode
            .clone()
            .ok_or_else(|| StageError::new(ErrorCode::InternalError, "transcode result missing"))?;

        // Subtitles: best-effort, never fails the job.
        if !results.is_completed(Stage::SubtitlesExtraction) {
            match self
                .run_stage(job, Stage::SubtitlesExtraction, heartbeat, || {
                    self.activities.extract_subtitles(
                        job,
                        &metadata,
                        transcode.intro_duration_sec,
                        workspace,
                        cancel,
                        heartbeat,
                    )
                })
                .await
            {
                Ok(subtitles) => results.subtitles = Some(subtitles),
                Err(err) if err.code == ErrorCode::Canceled => return Err(err),
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "subtitle extraction failed, continuing");
                }
            }
            results.mark(Stage::SubtitlesExtraction);
            self.persist_results(job.id, results);
        }
        self.check_cancel(job.id)?;

        // Thumbnails: best-effort, never fails the job.
        if !results.is_completed(Stage::ThumbnailsGeneration) {
            match self
                .run_stage(job, Stage::ThumbnailsGeneration, heartbeat, || {
                    self.activities
                        .generate_thumbnails(job, &metadata, workspace, cancel, heartbeat)
                })
                .await
            {
                Ok(thumbnails) => results.thumbnails = Some(thumbnails),
                Err(err) if err.code == ErrorCode::Canceled => return Err(err),
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "thumbnail generation failed, continuing");
                }
            }
            results.mark(Stage::ThumbnailsGeneration);
            self.persist_results(job.id, results);
        }
        self.check_cancel(job.id)?;

        // HLS segmentation.
        if !results.is_completed(Stage::HlsSegmentation) {
            let _slot = self.acquire_ffmpeg_slot().await?;
            let hls = self
                .run_stage(job, Stage::HlsSegmentation, heartbeat, || {
                    self.activities
                        .segment_hls(job, &transcode, &metadata, workspace, cancel, heartbeat)
                })
                .await?;
            results.hls = Some(hls);
            results.mark(Stage::HlsSegmentation);
            self.persist_results(job.id, results);
        }
        self.check_cancel(job.id)?;

        // Upload.
        if !results.is_completed(Stage::Uploading) {
            let count = self
                .run_stage(job, Stage::Uploading, heartbeat, || {
                    self.activities.upload_artifacts(job, workspace, heartbeat)
                })
                .await?;
            results.artifact_count = Some(count);
            results.mark(Stage::Uploading);
            self.persist_results(job.id, results);
        }

        // Cleanup.
        if !results.is_completed(Stage::Cleanup) {
            self.run_stage(job, Stage::Cleanup, heartbeat, || {
                self.activities.cleanup(job, workspace, heartbeat)
            })
            .await?;
            results.mark(Stage::Cleanup);
            self.persist_results(job.id, results);
        }

        Ok(())
    }

    async fn acquire_ffmpeg_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>, StageError> {
        self.ffmpeg_slots
            .acquire()
            .await
            .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))
    }

    /// Non-blocking cancellation check at a stage boundary. The store
    /// flag bridges cancel requests from other processes into the
    /// in-process registry.
    fn check_cancel(&self, job_id: Uuid) -> Result<(), StageError> {
        match self.store.cancel_requested(job_id) {
            Ok(true) => {
                self.cancellations.cancel(job_id);
            }
            Ok(false) => {}
            Err(err) => warn!(job_id = %job_id, error = %err, "failed to poll cancel flag"),
        }
        if self.cancellations.token(job_id).is_cancelled() {
            return Err(StageError::canceled());
        }
        Ok(())
    }

    fn persist_results(&self, job_id: Uuid, results: &StageResults) {
        match serde_json::to_value(results) {
            Ok(value) => {
                if let Err(err) = self.store.save_stage_results(job_id, &value) {
                    warn!(job_id = %job_id, error = %err, "failed to persist stage results");
                }
            }
            Err(err) => warn!(job_id = %job_id, error = %err, "failed to serialize stage results"),
        }
    }

    /// One stage under its retry policy. Every failed attempt is
    /// recorded as a `ConversionError` row; fatal errors short-circuit.
    async fn run_stage<T, F, Fut>(
        &self,
        job: &Job,
        stage: Stage,
        heartbeat: &Heartbeat,
        mut attempt_fn: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StageResult<T>>,
    {
        let policy = RetryPolicy::for_stage(stage);

        for attempt in 1..=policy.max_attempts {
            heartbeat.beat();
            let supervised = self
                .supervise(policy, heartbeat, attempt_fn())
                .await;

            let (stage_err, heartbeat_stale) = match supervised {
                Supervised::Finished(Ok(value)) => return Ok(value),
                Supervised::Finished(Err(err)) => (err, false),
                Supervised::AttemptTimeout => (
                    StageError::new(
                        ErrorCode::Timeout,
                        format!("stage exceeded wall-clock of {:?}", policy.attempt_timeout),
                    ),
                    false,
                ),
                Supervised::HeartbeatStale => (
                    StageError::new(
                        ErrorCode::Timeout,
                        format!(
                            "stage heartbeat older than {:?}",
                            policy.heartbeat_timeout.unwrap_or_default()
                        ),
                    ),
                    true,
                ),
            };

            let mut conv =
                ConversionError::new(job.id, stage, stage_err.code, stage_err.message.clone(), attempt);
            conv.details = stage_err.details.clone();
            if let Err(err) = self.store.record_error(&conv) {
                warn!(job_id = %job.id, error = %err, "failed to record conversion error");
            }

            // A stale heartbeat is worth another attempt; everything
            // fatal in the taxonomy short-circuits.
            let retryable =
                heartbeat_stale || stage_err.class() == crate::domain::ErrorClass::Retryable;
            if !retryable
                || stage_err.code == ErrorCode::Canceled
                || attempt == policy.max_attempts
            {
                return Err(stage_err);
            }

            let backoff = policy.backoff(attempt);
            warn!(
                job_id = %job.id,
                stage = %stage,
                attempt,
                wait = ?backoff,
                error = %stage_err,
                "retrying stage"
            );
            tokio::time::sleep(backoff).await;
        }

        Err(StageError::new(
            ErrorCode::InternalError,
            "retry policy exhausted without outcome",
        ))
    }

    /// Bounds one attempt by the policy's wall clock and heartbeat
    /// freshness.
    async fn supervise<T, Fut>(
        &self,
        policy: RetryPolicy,
        heartbeat: &Heartbeat,
        fut: Fut,
    ) -> Supervised<T>
    where
        Fut: std::future::Future<Output = StageResult<T>>,
    {
        tokio::pin!(fut);
        let deadline = tokio::time::sleep(policy.attempt_timeout);
        tokio::pin!(deadline);
        let mut watchdog = tokio::time::interval(WATCHDOG_POLL);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        watchdog.tick().await;

        loop {
            tokio::select! {
                result = &mut fut => return Supervised::Finished(result),
                _ = &mut deadline => return Supervised::AttemptTimeout,
                _ = watchdog.tick() => {
                    if let Some(heartbeat_timeout) = policy.heartbeat_timeout {
                        if heartbeat.elapsed() > heartbeat_timeout {
                            return Supervised::HeartbeatStale;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_results_track_completion_once() {
        let mut results = StageResults::default();
        assert!(!results.is_completed(Stage::Validation));
        results.mark(Stage::Validation);
        results.mark(Stage::Validation);
        assert!(results.is_completed(Stage::Validation));
        assert_eq!(results.completed.len(), 1);
    }

    #[test]
    fn stage_results_round_trip_through_json() {
        let mut results = StageResults::default();
        results.mark(Stage::MetadataExtraction);
        results.metadata = Some(VideoMetadata {
            duration_sec: 10.0,
            width: 1920,
            height: 1080,
            ..VideoMetadata::default()
        });
        let value = serde_json::to_value(&results).unwrap();
        let parsed: StageResults = serde_json::from_value(value).unwrap();
        assert!(parsed.is_completed(Stage::MetadataExtraction));
        assert_eq!(parsed.metadata.unwrap().height, 1080);
    }

    #[tokio::test]
    async fn heartbeat_tracks_elapsed_time() {
        let heartbeat = Heartbeat::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(heartbeat.elapsed() >= Duration::from_millis(30));
        heartbeat.beat();
        assert!(heartbeat.elapsed() < Duration::from_millis(30));
    }
}
