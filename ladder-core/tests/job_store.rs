use ladder_core::domain::{
    Artifact, ArtifactType, ConversionError, ErrorCode, Job, JobStatus, Profile, Quality, Stage,
};
use ladder_core::store::StoreError;
use ladder_core::SqliteJobStore;

fn setup_store() -> (tempfile::TempDir, SqliteJobStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.sqlite");
    let store = SqliteJobStore::builder()
        .path(&path)
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    (dir, store)
}

fn sample_job() -> Job {
    let mut profile = Profile::default();
    profile.qualities = vec![Quality::Q480p, Quality::Q720p];
    Job::new("ingest", "library/movie.mkv", profile)
}

#[test]
fn create_and_fetch_round_trips_the_profile() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    let fetched = store.get(job.id).unwrap().unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.status, JobStatus::Queued);
    assert_eq!(fetched.source_bucket, "ingest");
    assert_eq!(
        fetched.profile.qualities,
        vec![Quality::Q480p, Quality::Q720p]
    );
    assert_eq!(fetched.lock_version, 0);
    assert!(fetched.finished_at.is_none());
    assert!(store.get(uuid::Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn idempotency_key_is_unique() {
    let (_dir, store) = setup_store();
    let mut first = sample_job();
    first.idempotency_key = Some("submit-42".into());
    store.create(&first).unwrap();

    let mut second = sample_job();
    second.idempotency_key = Some("submit-42".into());
    let err = store.create(&second).unwrap_err();
    assert!(matches!(err, StoreError::IdempotencyConflict));

    // Lookup-then-insert admission resolves to the original job id.
    let found = store.find_by_idempotency_key("submit-42").unwrap().unwrap();
    assert_eq!(found.id, first.id);
}

#[test]
fn optimistic_locking_lets_exactly_one_writer_win() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    let mut writer_a = store.get(job.id).unwrap().unwrap();
    let mut writer_b = store.get(job.id).unwrap().unwrap();

    writer_a.priority = 7;
    store.update(&mut writer_a).unwrap();
    assert_eq!(writer_a.lock_version, 1);

    writer_b.priority = 9;
    let err = store.update(&mut writer_b).unwrap_err();
    assert!(matches!(err, StoreError::ConcurrentModification));

    // The loser re-reads and succeeds; the version advances by one per
    // successful update.
    let mut fresh = store.get(job.id).unwrap().unwrap();
    assert_eq!(fresh.priority, 7);
    fresh.priority = 9;
    store.update(&mut fresh).unwrap();
    assert_eq!(fresh.lock_version, 2);
}

#[test]
fn progress_writes_never_move_overall_backwards() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    store
        .update_progress(job.id, Stage::Transcoding, 50, 35)
        .unwrap();
    let snapshot = store.get(job.id).unwrap().unwrap();
    assert_eq!(snapshot.current_stage, Some(Stage::Transcoding));
    assert_eq!(snapshot.stage_progress, 50);
    assert_eq!(snapshot.overall_progress, 35);

    // A retried stage reports from zero again; the persisted overall
    // keeps its high-water mark.
    store
        .update_progress(job.id, Stage::Transcoding, 0, 10)
        .unwrap();
    let snapshot = store.get(job.id).unwrap().unwrap();
    assert_eq!(snapshot.stage_progress, 0);
    assert_eq!(snapshot.overall_progress, 35);
}

#[test]
fn lifecycle_transitions_stamp_timestamps() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    store.set_started(job.id).unwrap();
    let running = store.get(job.id).unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.started_at.is_some());
    assert!(running.finished_at.is_none());

    store.set_finished(job.id, JobStatus::Completed).unwrap();
    let finished = store.get(job.id).unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.overall_progress, 100);
    assert!(finished.finished_at.is_some());

    // Terminal statuses are write-once.
    store.set_finished(job.id, JobStatus::Failed).unwrap();
    let still = store.get(job.id).unwrap().unwrap();
    assert_eq!(still.status, JobStatus::Completed);
}

#[test]
fn failed_jobs_keep_their_progress() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();
    store
        .update_progress(job.id, Stage::Transcoding, 40, 30)
        .unwrap();
    store.set_finished(job.id, JobStatus::Failed).unwrap();
    let failed = store.get(job.id).unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.overall_progress, 30);
    assert!(failed.finished_at.is_some());
}

#[test]
fn recording_an_error_patches_the_job_row() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    let first = ConversionError::new(
        job.id,
        Stage::Uploading,
        ErrorCode::NetworkError,
        "connection reset",
        1,
    );
    store.record_error(&first).unwrap();
    let second = ConversionError::new(
        job.id,
        Stage::Uploading,
        ErrorCode::NetworkError,
        "connection reset again",
        2,
    )
    .with_detail("key", "hls/master.m3u8");
    store.record_error(&second).unwrap();

    let patched = store.get(job.id).unwrap().unwrap();
    assert_eq!(patched.last_error_id, Some(second.id));
    assert_eq!(patched.attempt, 2);

    let errors = store.errors_for_job(job.id).unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].id, second.id);
    assert_eq!(errors[0].details["key"], "hls/master.m3u8");
    assert_eq!(errors[1].message, "connection reset");
}

#[test]
fn artifacts_are_batched_and_cascade_with_the_job() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    let artifacts = vec![
        Artifact::new(job.id, ArtifactType::HlsMaster, "vod", "v/j/hls/master.m3u8")
            .with_size(245)
            .with_checksum("etag-1"),
        Artifact::new(job.id, ArtifactType::Segment, "vod", "v/j/hls/480p_00000.ts").with_size(4096),
    ];
    store.create_artifacts(&artifacts).unwrap();

    let error = ConversionError::new(job.id, Stage::Uploading, ErrorCode::NetworkError, "x", 1);
    store.record_error(&error).unwrap();

    let stored = store.artifacts_for_job(job.id).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].artifact_type, ArtifactType::Segment);
    assert_eq!(stored[1].artifact_type, ArtifactType::HlsMaster);
    assert_eq!(stored[1].checksum.as_deref(), Some("etag-1"));

    store.delete(job.id).unwrap();
    assert!(store.get(job.id).unwrap().is_none());
    assert!(store.artifacts_for_job(job.id).unwrap().is_empty());
    assert!(store.errors_for_job(job.id).unwrap().is_empty());
}

#[test]
fn stage_results_blob_round_trips() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    assert!(store.load_stage_results(job.id).unwrap().is_none());

    let blob = serde_json::json!({
        "completed": ["METADATA_EXTRACTION", "VALIDATION"],
        "metadata": null,
    });
    store.save_stage_results(job.id, &blob).unwrap();
    let loaded = store.load_stage_results(job.id).unwrap().unwrap();
    assert_eq!(loaded["completed"][1], "VALIDATION");
}

#[test]
fn cancel_flag_only_applies_to_live_jobs() {
    let (_dir, store) = setup_store();
    let job = sample_job();
    store.create(&job).unwrap();

    assert!(!store.cancel_requested(job.id).unwrap());
    assert!(store.request_cancel(job.id).unwrap());
    assert!(store.cancel_requested(job.id).unwrap());
    // Idempotent.
    assert!(store.request_cancel(job.id).unwrap());

    let done = sample_job();
    store.create(&done).unwrap();
    store.set_finished(done.id, JobStatus::Completed).unwrap();
    assert!(!store.request_cancel(done.id).unwrap());
}

#[test]
fn list_by_status_orders_by_priority_then_age() {
    let (_dir, store) = setup_store();
    let mut low = sample_job();
    low.priority = 0;
    let mut high = sample_job();
    high.priority = 10;
    store.create(&low).unwrap();
    store.create(&high).unwrap();

    let queued = store.list_by_status(JobStatus::Queued, 10).unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].id, high.id);
    assert_eq!(queued[1].id, low.id);

    let counts = store.count_by_status().unwrap();
    assert_eq!(counts.get("QUEUED"), Some(&2));
}
