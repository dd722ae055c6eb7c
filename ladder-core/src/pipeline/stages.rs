//! Stage implementations: the glue between the orchestrator, the FFmpeg
//! layer, the store, and object storage.
//!
//! Every activity follows the same contract: emit `stage_progress = 0`
//! on entry, heartbeat through long waits, classify failures into the
//! closed taxonomy, and emit `stage_progress = 100` with a small
//! serializable result on success.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LadderConfig;
use crate::domain::{
    is_container_supported, is_video_codec_supported, overall_progress, ContainerFormat,
    EncodingTier, ErrorCode, Job, Quality, Stage, VideoMetadata,
};
use crate::drm::DrmPackager;
use crate::ffmpeg::{
    progress_percent, validate_output, CommandBuilder, CommandExecutor, EncryptionInfo, Prober,
    Progress, Runner,
};
use crate::playlist::{
    dash, master_playlist, multi_tier_master_playlist, shift_vtt_timestamps, thumbnail_vtt,
};
use crate::storage::{DirectoryUploader, ObjectStorage, UploadProgress};
use crate::store::SqliteJobStore;
use crate::workspace::Workspace;

use super::cancel::CancelToken;
use super::error::{StageError, StageResult};
use super::Heartbeat;

const DOWNLOAD_HEARTBEAT: Duration = Duration::from_secs(30);
/// Free disk must cover this many times the source size before
/// transcoding starts.
const DISK_HEADROOM_FACTOR: u64 = 5;

/// Transcoded rendition paths, keyed tier then quality.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranscodeOutput {
    pub tier_outputs: BTreeMap<EncodingTier, BTreeMap<Quality, PathBuf>>,
    pub enabled_tiers: Vec<EncodingTier>,
    pub qualities: Vec<Quality>,
    #[serde(default)]
    pub intro_duration_sec: f64,
}

pub type SubtitlesOutput = BTreeMap<String, PathBuf>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThumbnailsOutput {
    pub tile_paths: Vec<PathBuf>,
    pub vtt_path: PathBuf,
    pub frame_count: usize,
    pub interval_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HlsOutput {
    pub master_path: PathBuf,
    pub mpd_path: Option<PathBuf>,
    pub hls_dir: PathBuf,
    pub encrypted: bool,
    pub drm_enabled: bool,
    pub drm_provider: Option<String>,
    pub key_id: Option<String>,
    pub multi_tier: bool,
}

#[derive(Clone)]
pub struct Activities {
    config: Arc<LadderConfig>,
    store: SqliteJobStore,
    storage: Arc<dyn ObjectStorage>,
    executor: Arc<dyn CommandExecutor>,
}

impl Activities {
    pub fn new(
        config: Arc<LadderConfig>,
        store: SqliteJobStore,
        storage: Arc<dyn ObjectStorage>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            config,
            store,
            storage,
            executor,
        }
    }

    fn runner(&self) -> Runner {
        Runner::new(
            &self.config.ffmpeg.binary_path,
            self.config.ffmpeg.process_timeout(),
        )
    }

    fn builder(&self) -> CommandBuilder {
        CommandBuilder::new(
            self.config.worker.enable_gpu,
            &self.config.encoding.h265_preset,
            self.config.encoding.h265_crf,
        )
    }

    fn enabled_tiers(&self) -> Vec<EncodingTier> {
        let mut tiers = Vec::new();
        if self.config.encoding.enable_legacy_tier {
            tiers.push(EncodingTier::Legacy);
        }
        if self.config.encoding.enable_modern_tier {
            tiers.push(EncodingTier::Modern);
        }
        if tiers.is_empty() {
            tiers.push(EncodingTier::Legacy);
        }
        tiers
    }

    /// Progress write plus heartbeat renewal. Persistence failures are
    /// logged, not propagated; progress is advisory.
    fn report(&self, job_id: Uuid, stage: Stage, stage_progress: u32, heartbeat: &Heartbeat) {
        if let Err(err) = self.store.update_progress(
            job_id,
            stage,
            stage_progress,
            overall_progress(stage, stage_progress),
        ) {
            warn!(job_id = %job_id, stage = %stage, error = %err, "failed to persist progress");
        }
        heartbeat.beat();
    }

    /// Runner callback that maps subprocess out_time onto a slice of the
    /// stage's progress range.
    fn transcode_progress_fn(
        &self,
        job_id: Uuid,
        stage: Stage,
        heartbeat: &Heartbeat,
        duration_sec: f64,
        task_index: usize,
        total_tasks: usize,
    ) -> Arc<dyn Fn(&Progress) + Send + Sync> {
        let activities = self.clone();
        let heartbeat = heartbeat.clone();
        Arc::new(move |progress: &Progress| {
            let percent = progress_percent(progress.out_time, duration_sec) as usize;
            let stage_percent = ((task_index * 100 + percent) / total_tasks.max(1)) as u32;
            activities.report(job_id, stage, stage_percent, &heartbeat);
        })
    }

    fn source_path(&self, job: &Job, workspace: &Workspace) -> PathBuf {
        workspace.input_path(&source_filename(&job.source_key))
    }

    // ---- metadata_extraction ----

    pub async fn extract_metadata(
        &self,
        job: &Job,
        workspace: &Workspace,
        heartbeat: &Heartbeat,
    ) -> StageResult<VideoMetadata> {
        let stage = Stage::MetadataExtraction;
        self.report(job.id, stage, 0, heartbeat);

        workspace.create()?;

        let input_path = self.source_path(job, workspace);
        with_heartbeat(
            heartbeat,
            self.storage
                .download(&job.source_bucket, &job.source_key, &input_path),
        )
        .await?;
        self.report(job.id, stage, 50, heartbeat);

        let prober = Prober::new(&self.config.ffmpeg.ffprobe_path, self.executor.clone());
        let metadata = prober.probe(&input_path).await?;

        let meta_path = workspace.meta_path("metadata.json");
        let payload = serde_json::to_vec_pretty(&metadata)?;
        std::fs::write(&meta_path, payload)
            .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;

        self.report(job.id, stage, 100, heartbeat);
        info!(
            job_id = %job.id,
            duration_sec = metadata.duration_sec,
            width = metadata.width,
            height = metadata.height,
            video_codec = %metadata.video_codec,
            container = %metadata.container,
            "metadata extracted"
        );
        Ok(metadata)
    }

    // ---- validation ----

    pub async fn validate(
        &self,
        job: &Job,
        metadata: &VideoMetadata,
        heartbeat: &Heartbeat,
    ) -> StageResult<()> {
        let stage = Stage::Validation;
        self.report(job.id, stage, 0, heartbeat);

        if !is_container_supported(&metadata.container) {
            return Err(StageError::new(
                ErrorCode::UnsupportedFormat,
                format!("unsupported container: {}", metadata.container),
            ));
        }
        if !is_video_codec_supported(&metadata.video_codec) {
            return Err(StageError::new(
                ErrorCode::UnsupportedFormat,
                format!("unsupported video codec: {}", metadata.video_codec),
            ));
        }
        self.report(job.id, stage, 50, heartbeat);

        if let Some(free) = free_disk_space(&self.config.worker.workdir_root) {
            let required = metadata.file_size.saturating_mul(DISK_HEADROOM_FACTOR);
            if free < required {
                return Err(StageError::new(
                    ErrorCode::InsufficientDisk,
                    format!("insufficient disk space: {free} bytes free, {required} required"),
                ));
            }
        }

        self.storage
            .health()
            .await
            .map_err(|err| StageError::new(ErrorCode::S3AccessDenied, err.to_string()))?;

        self.report(job.id, stage, 100, heartbeat);
        info!(job_id = %job.id, "validation passed");
        Ok(())
    }

    // ---- transcoding ----

    pub async fn transcode(
        &self,
        job: &Job,
        metadata: &VideoMetadata,
        workspace: &Workspace,
        cancel: &CancelToken,
        heartbeat: &Heartbeat,
    ) -> StageResult<TranscodeOutput> {
        let stage = Stage::Transcoding;
        self.report(job.id, stage, 0, heartbeat);

        let tiers = self.enabled_tiers();
        let qualities =
            Quality::filter_for_resolution(&job.profile.effective_qualities(), metadata.height);

        let source = self.source_path(job, workspace);
        let (input_path, intro_duration_sec) = match &job.profile.intro {
            Some(intro) => {
                self.prepend_intro(job, intro, &source, workspace, cancel, heartbeat)
                    .await?
            }
            None => (source, 0.0),
        };

        info!(
            job_id = %job.id,
            tiers = tiers.len(),
            qualities = qualities.len(),
            "transcoding renditions"
        );

        let runner = self.runner();
        let builder = self.builder();
        let total_tasks = tiers.len() * qualities.len();
        let duration_sec = metadata.duration_sec + intro_duration_sec;
        let mut tier_outputs: BTreeMap<EncodingTier, BTreeMap<Quality, PathBuf>> = BTreeMap::new();
        let mut task_index = 0usize;

        for tier in &tiers {
            let tier_dir = workspace.transcoded_dir(*tier);
            std::fs::create_dir_all(&tier_dir)
                .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;

            for quality in &qualities {
                if cancel.is_cancelled() {
                    return Err(StageError::canceled());
                }

                let command =
                    builder.transcode(&input_path, &tier_dir, *quality, *tier, metadata, &job.profile);
                let progress_fn = self.transcode_progress_fn(
                    job.id,
                    stage,
                    heartbeat,
                    duration_sec,
                    task_index,
                    total_tasks,
                );

                runner
                    .run(&command.args, cancel, Some(progress_fn))
                    .await
                    .map_err(|err| {
                        StageError::from(err)
                            .with_detail("tier", tier.as_str())
                            .with_detail("quality", quality.as_str())
                    })?;
                validate_output(&command.output_path)?;

                tier_outputs
                    .entry(*tier)
                    .or_default()
                    .insert(*quality, command.output_path.clone());
                task_index += 1;
                info!(
                    job_id = %job.id,
                    tier = %tier,
                    quality = %quality,
                    output = %command.output_path.display(),
                    "rendition transcoded"
                );
            }
        }

        self.report(job.id, stage, 100, heartbeat);
        Ok(TranscodeOutput {
            tier_outputs,
            enabled_tiers: tiers,
            qualities,
            intro_duration_sec,
        })
    }

    /// Downloads the configured intro clip and concatenates it in front
    /// of the source, returning the combined input and intro length.
    async fn prepend_intro(
        &self,
        job: &Job,
        intro: &crate::domain::IntroParams,
        source: &Path,
        workspace: &Workspace,
        cancel: &CancelToken,
        heartbeat: &Heartbeat,
    ) -> StageResult<(PathBuf, f64)> {
        let intro_path = workspace.input_path(&format!(
            "intro.{}",
            Path::new(&intro.s3_key)
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "mp4".to_string())
        ));
        with_heartbeat(
            heartbeat,
            self.storage
                .download(&job.source_bucket, &intro.s3_key, &intro_path),
        )
        .await?;

        let prober = Prober::new(&self.config.ffmpeg.ffprobe_path, self.executor.clone());
        let intro_meta = prober.probe(&intro_path).await?;

        let combined = workspace.input_path("with_intro.mp4");
        let command = self.builder().concat(&intro_path, source, &combined);
        let heartbeat_clone = heartbeat.clone();
        self.runner()
            .run(
                &command.args,
                cancel,
                Some(Arc::new(move |_: &Progress| heartbeat_clone.beat())),
            )
            .await?;
        validate_output(&combined)?;

        Ok((combined, intro_meta.duration_sec))
    }

    // ---- subtitles_extraction (best-effort) ----

    pub async fn extract_subtitles(
        &self,
        job: &Job,
        metadata: &VideoMetadata,
        intro_duration_sec: f64,
        workspace: &Workspace,
        cancel: &CancelToken,
        heartbeat: &Heartbeat,
    ) -> StageResult<SubtitlesOutput> {
        let stage = Stage::SubtitlesExtraction;
        self.report(job.id, stage, 0, heartbeat);

        if metadata.subtitle_tracks.is_empty() {
            info!(job_id = %job.id, "no subtitle streams to extract");
            self.report(job.id, stage, 100, heartbeat);
            return Ok(SubtitlesOutput::new());
        }

        let input = self.source_path(job, workspace);
        let runner = self.runner();
        let builder = self.builder();
        let total = metadata.subtitle_tracks.len();
        let mut extracted = SubtitlesOutput::new();

        for (index, track) in metadata.subtitle_tracks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StageError::canceled());
            }

            let lang = if track.language.is_empty() || track.language == "und" {
                format!("track{}", track.index)
            } else {
                track.language.clone()
            };
            let output = workspace.subtitle_path(&lang);
            let command = builder.subtitle_extract(&input, &output, track.index);

            match runner.run(&command.args, cancel, None).await {
                Ok(()) => {}
                Err(err) => {
                    let stage_err = StageError::from(err);
                    if stage_err.code == ErrorCode::Canceled {
                        return Err(stage_err);
                    }
                    // Individual track failures are warnings only.
                    warn!(job_id = %job.id, language = %lang, error = %stage_err, "subtitle extraction failed");
                    continue;
                }
            }

            if intro_duration_sec > 0.0 {
                shift_subtitle_file(&output, intro_duration_sec)?;
            }

            extracted.insert(lang, output);
            self.report(
                job.id,
                stage,
                ((index + 1) * 100 / total) as u32,
                heartbeat,
            );
        }

        self.report(job.id, stage, 100, heartbeat);
        info!(job_id = %job.id, count = extracted.len(), "subtitles extracted");
        Ok(extracted)
    }

    // ---- thumbnails_generation (best-effort) ----

    pub async fn generate_thumbnails(
        &self,
        job: &Job,
        metadata: &VideoMetadata,
        workspace: &Workspace,
        cancel: &CancelToken,
        heartbeat: &Heartbeat,
    ) -> StageResult<ThumbnailsOutput> {
        let stage = Stage::ThumbnailsGeneration;
        self.report(job.id, stage, 0, heartbeat);

        let mut params = job.profile.thumbnails;
        if params.max_frames == 0 {
            params.max_frames = self.config.thumbnails.max_frames;
        }
        if params.tile_x == 0 {
            params.tile_x = 5;
        }
        if params.tile_y == 0 {
            params.tile_y = 5;
        }
        if params.width == 0 {
            params.width = 160;
        }
        if params.height == 0 {
            params.height = 90;
        }

        let interval_sec = thumbnail_interval(metadata.duration_sec, params.max_frames);
        let thumbs_dir = workspace.thumbs_dir();
        let input = self.source_path(job, workspace);
        let runner = self.runner();
        let builder = self.builder();

        let pattern = thumbs_dir.join("thumb_%05d.jpg");
        let command = builder.thumbnails(&input, &pattern, interval_sec, params.width, params.height);
        let extract_progress = {
            let activities = self.clone();
            let heartbeat = heartbeat.clone();
            let duration_sec = metadata.duration_sec;
            let job_id = job.id;
            Arc::new(move |progress: &Progress| {
                let percent = progress_percent(progress.out_time, duration_sec) / 2;
                activities.report(job_id, stage, percent, &heartbeat);
            })
        };
        runner
            .run(&command.args, cancel, Some(extract_progress))
            .await?;

        let mut frame_paths = list_frames(&thumbs_dir)
            .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;
        frame_paths.sort();
        let frame_count = frame_paths.len();

        let per_tile = (params.tile_x * params.tile_y) as usize;
        let mut tile_paths = Vec::new();
        for (tile_index, chunk) in frame_paths.chunks(per_tile.max(1)).enumerate() {
            if cancel.is_cancelled() {
                return Err(StageError::canceled());
            }
            let concat_path = thumbs_dir.join(format!("tile_{tile_index:03}_concat.txt"));
            let mut listing = String::new();
            for frame in chunk {
                listing.push_str(&format!("file '{}'\n", frame.display()));
            }
            if let Err(err) = std::fs::write(&concat_path, listing) {
                warn!(job_id = %job.id, error = %err, "failed to write tile concat list");
                continue;
            }

            let tile_path = thumbs_dir.join(format!("tile_{tile_index:03}.jpg"));
            let tile_command =
                builder.tile(&concat_path, &tile_path, params.tile_x, params.tile_y);
            let result = runner.run(&tile_command.args, cancel, None).await;
            let _ = std::fs::remove_file(&concat_path);
            match result {
                Ok(()) => tile_paths.push(tile_path),
                Err(err) => {
                    let stage_err = StageError::from(err);
                    if stage_err.code == ErrorCode::Canceled {
                        return Err(stage_err);
                    }
                    warn!(job_id = %job.id, tile = tile_index, error = %stage_err, "tile generation failed");
                }
            }
        }

        self.report(job.id, stage, 80, heartbeat);

        let tile_names: Vec<String> = tile_paths
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let vtt_path = thumbs_dir.join("thumbnails.vtt");
        let vtt = thumbnail_vtt(
            &tile_names,
            frame_count,
            interval_sec,
            params.width,
            params.height,
            params.tile_x,
            params.tile_y,
        );
        std::fs::write(&vtt_path, vtt)
            .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;

        // The mosaics supersede the per-frame intermediates.
        for frame in &frame_paths {
            let _ = std::fs::remove_file(frame);
        }

        self.report(job.id, stage, 100, heartbeat);
        info!(job_id = %job.id, tiles = tile_paths.len(), frames = frame_count, "thumbnails generated");
        Ok(ThumbnailsOutput {
            tile_paths,
            vtt_path,
            frame_count,
            interval_sec,
        })
    }

    // ---- hls_segmentation ----

    pub async fn segment_hls(
        &self,
        job: &Job,
        transcode: &TranscodeOutput,
        metadata: &VideoMetadata,
        workspace: &Workspace,
        cancel: &CancelToken,
        heartbeat: &Heartbeat,
    ) -> StageResult<HlsOutput> {
        let stage = Stage::HlsSegmentation;
        self.report(job.id, stage, 0, heartbeat);

        let hls_dir = workspace.hls_dir();
        let segment_duration = if job.profile.hls.segment_duration_sec == 0 {
            self.config.hls.segment_duration_sec
        } else {
            job.profile.hls.segment_duration_sec
        };

        if self.config.drm.enabled {
            let packager = DrmPackager::new(self.config.drm.clone(), self.executor.clone());
            if packager.is_available() {
                return self
                    .segment_with_drm(job, transcode, &packager, &hls_dir, heartbeat)
                    .await;
            }
            warn!(job_id = %job.id, "DRM enabled but packager binary missing, falling back to AES-128 path");
        }

        let encryption = if self.config.hls.enable_encryption {
            Some(EncryptionInfo::generate(
                &hls_dir,
                job.id,
                &self.config.hls.key_url,
            )?)
        } else {
            None
        };

        let multi_tier = transcode.enabled_tiers != [EncodingTier::Legacy];
        let runner = self.runner();
        let builder = self.builder();
        let total_tasks: usize = transcode.tier_outputs.values().map(|m| m.len()).sum();
        let mut task_index = 0usize;

        for tier in &transcode.enabled_tiers {
            let Some(renditions) = transcode.tier_outputs.get(tier) else {
                continue;
            };
            let output_dir = if multi_tier {
                let dir = workspace.tier_hls_dir(*tier);
                std::fs::create_dir_all(&dir)
                    .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;
                dir
            } else {
                hls_dir.clone()
            };

            for (quality, input) in renditions {
                if cancel.is_cancelled() {
                    return Err(StageError::canceled());
                }
                let command = builder.hls_segment(
                    input,
                    &output_dir,
                    quality.as_str(),
                    segment_duration,
                    *tier,
                    encryption.as_ref(),
                );
                let heartbeat_clone = heartbeat.clone();
                runner
                    .run(
                        &command.args,
                        cancel,
                        Some(Arc::new(move |_: &Progress| heartbeat_clone.beat())),
                    )
                    .await
                    .map_err(|err| {
                        StageError::from(err)
                            .with_detail("tier", tier.as_str())
                            .with_detail("quality", quality.as_str())
                    })?;

                task_index += 1;
                self.report(
                    job.id,
                    stage,
                    (task_index * 100 / total_tasks.max(1)) as u32,
                    heartbeat,
                );
                info!(job_id = %job.id, tier = %tier, quality = %quality, "rendition segmented");
            }
        }

        let master = if multi_tier {
            multi_tier_master_playlist(&transcode.qualities, &transcode.enabled_tiers, true)
        } else {
            master_playlist(&transcode.qualities, true)
        };
        let master_path = hls_dir.join("master.m3u8");
        std::fs::write(&master_path, master)
            .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;

        let mpd_path = transcode
            .enabled_tiers
            .iter()
            .find(|tier| tier.config().container == ContainerFormat::Fmp4)
            .map(|tier| -> StageResult<PathBuf> {
                let manifest = dash::DashManifest {
                    duration_sec: metadata.duration_sec + transcode.intro_duration_sec,
                    segment_duration_sec: segment_duration,
                    qualities: transcode.qualities.clone(),
                    tier: *tier,
                    frame_rate: metadata.fps,
                    base_url: None,
                };
                let path = hls_dir.join("manifest.mpd");
                std::fs::write(&path, dash::mpd(&manifest))
                    .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;
                Ok(path)
            })
            .transpose()?;

        self.report(job.id, stage, 100, heartbeat);
        info!(
            job_id = %job.id,
            master = %master_path.display(),
            multi_tier,
            encrypted = encryption.is_some(),
            "hls segmentation complete"
        );
        Ok(HlsOutput {
            master_path,
            mpd_path,
            hls_dir,
            encrypted: encryption.is_some(),
            drm_enabled: false,
            drm_provider: None,
            key_id: None,
            multi_tier,
        })
    }

    async fn segment_with_drm(
        &self,
        job: &Job,
        transcode: &TranscodeOutput,
        packager: &DrmPackager,
        hls_dir: &Path,
        heartbeat: &Heartbeat,
    ) -> StageResult<HlsOutput> {
        let stage = Stage::HlsSegmentation;
        self.report(job.id, stage, 10, heartbeat);

        let inputs = transcode
            .tier_outputs
            .get(&EncodingTier::Legacy)
            .or_else(|| transcode.tier_outputs.values().next())
            .cloned()
            .unwrap_or_default();

        let result = with_heartbeat(heartbeat, packager.package(&inputs, hls_dir, job.id))
            .await
            .map_err(|err| {
                StageError::new(ErrorCode::FfmpegFailed, format!("DRM packaging failed: {err}"))
            })?;

        self.report(job.id, stage, 100, heartbeat);
        info!(
            job_id = %job.id,
            master = %result.master_path.display(),
            mpd = %result.mpd_path.display(),
            key_id = %result.key_id,
            "drm packaging complete"
        );
        Ok(HlsOutput {
            master_path: result.master_path,
            mpd_path: Some(result.mpd_path),
            hls_dir: hls_dir.to_path_buf(),
            encrypted: true,
            drm_enabled: true,
            drm_provider: Some(self.config.drm.provider.clone()),
            key_id: Some(result.key_id),
            multi_tier: false,
        })
    }

    // ---- uploading ----

    pub async fn upload_artifacts(
        &self,
        job: &Job,
        workspace: &Workspace,
        heartbeat: &Heartbeat,
    ) -> StageResult<usize> {
        let stage = Stage::Uploading;
        self.report(job.id, stage, 0, heartbeat);

        let bucket = self.config.s3.bucket_output.clone();
        let prefix = format!("{}/{}", job.output_group(), job.id);
        let uploader = DirectoryUploader::new(
            self.storage.clone(),
            self.config.worker.max_parallel_uploads,
        );

        let mut artifacts = Vec::new();

        // HLS output is the product; a failed mirror fails the stage.
        let hls = uploader
            .upload_directory(
                job.id,
                &workspace.hls_dir(),
                &bucket,
                &format!("{prefix}/hls"),
                Some(self.upload_progress_fn(job.id, heartbeat, 0, 50)),
            )
            .await?;
        artifacts.extend(hls);

        for (subdir, local_dir, base, span) in [
            ("thumbs", workspace.thumbs_dir(), 50u32, 30u32),
            ("subtitles", workspace.subtitles_dir(), 80, 10),
            ("meta", workspace.meta_dir(), 90, 10),
        ] {
            match uploader
                .upload_directory(
                    job.id,
                    &local_dir,
                    &bucket,
                    &format!("{prefix}/{subdir}"),
                    Some(self.upload_progress_fn(job.id, heartbeat, base, span)),
                )
                .await
            {
                Ok(batch) => artifacts.extend(batch),
                Err(err) => {
                    warn!(job_id = %job.id, subdir, error = %err, "auxiliary upload failed");
                }
            }
        }

        self.store.create_artifacts(&artifacts)?;
        self.report(job.id, stage, 100, heartbeat);
        info!(job_id = %job.id, count = artifacts.len(), "artifacts uploaded");
        Ok(artifacts.len())
    }

    fn upload_progress_fn(
        &self,
        job_id: Uuid,
        heartbeat: &Heartbeat,
        base: u32,
        span: u32,
    ) -> Arc<dyn Fn(UploadProgress) + Send + Sync> {
        let activities = self.clone();
        let heartbeat = heartbeat.clone();
        Arc::new(move |progress: UploadProgress| {
            let fraction = if progress.total_files == 0 {
                0
            } else {
                progress.completed_files * span as usize / progress.total_files
            };
            activities.report(
                job_id,
                Stage::Uploading,
                base + fraction as u32,
                &heartbeat,
            );
        })
    }

    // ---- cleanup ----

    pub async fn cleanup(
        &self,
        job: &Job,
        workspace: &Workspace,
        heartbeat: &Heartbeat,
    ) -> StageResult<()> {
        let stage = Stage::Cleanup;
        self.report(job.id, stage, 0, heartbeat);
        if let Err(err) = workspace.cleanup() {
            warn!(job_id = %job.id, error = %err, "workspace cleanup failed");
        }
        self.report(job.id, stage, 100, heartbeat);
        Ok(())
    }
}

/// Keeps the heartbeat fresh while awaiting a long network or disk call.
async fn with_heartbeat<F>(heartbeat: &Heartbeat, fut: F) -> F::Output
where
    F: std::future::Future,
{
    tokio::pin!(fut);
    let mut ticker = tokio::time::interval(DOWNLOAD_HEARTBEAT);
    ticker.tick().await;
    loop {
        tokio::select! {
            output = &mut fut => return output,
            _ = ticker.tick() => heartbeat.beat(),
        }
    }
}

pub(crate) fn source_filename(source_key: &str) -> String {
    match Path::new(source_key).extension() {
        Some(ext) => format!("source.{}", ext.to_string_lossy()),
        None => "source".to_string(),
    }
}

/// `interval = duration / min(max_frames, ceil(duration))`, floored at
/// one second so short sources do not explode into thousands of frames.
fn thumbnail_interval(duration_sec: f64, max_frames: u32) -> f64 {
    let frames = (max_frames as f64).min(duration_sec.ceil().max(1.0));
    let interval = duration_sec / frames;
    interval.max(1.0)
}

fn shift_subtitle_file(path: &Path, shift_sec: f64) -> StageResult<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;
    let shifted = shift_vtt_timestamps(&content, Duration::from_secs_f64(shift_sec));
    std::fs::write(path, shifted)
        .map_err(|err| StageError::new(ErrorCode::InternalError, err.to_string()))?;
    Ok(())
}

fn list_frames(thumbs_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(thumbs_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("thumb_") && name.ends_with(".jpg") {
            frames.push(entry.path());
        }
    }
    Ok(frames)
}

#[cfg(unix)]
fn free_disk_space(path: &str) -> Option<u64> {
    let c_path = std::ffi::CString::new(path.as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_disk_space(_path: &str) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_interval_floors_at_one_second() {
        // 10 s source, 200 frame cap: one frame per second.
        assert_eq!(thumbnail_interval(10.0, 200), 1.0);
        // 1000 s source, 200 frame cap: one frame every 5 s.
        assert_eq!(thumbnail_interval(1000.0, 200), 5.0);
        // Degenerate duration still yields a sane interval.
        assert_eq!(thumbnail_interval(0.0, 200), 1.0);
    }

    #[test]
    fn source_filename_keeps_extension() {
        assert_eq!(source_filename("library/movie.mkv"), "source.mkv");
        assert_eq!(source_filename("library/raw-stream"), "source");
    }
}
