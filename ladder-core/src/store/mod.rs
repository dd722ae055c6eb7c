//! SQLite-backed persistence for jobs, conversion errors, and artifacts.
//!
//! The store opens a fresh connection per operation; WAL mode plus a busy
//! timeout keeps concurrent orchestrators and status readers from
//! tripping over each other. Full-row updates go through optimistic
//! locking on `lock_version`; progress and status transitions are
//! targeted idempotent UPDATEs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Artifact, ArtifactType, ConversionError, ErrorClass, ErrorCode, Job, JobStatus, Profile, Stage,
};
use crate::sqlite::configure_connection;

const JOBS_SCHEMA: &str = include_str!("../../sql/jobs.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open job database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on job database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("a job with this idempotency key already exists")]
    IdempotencyConflict,
    #[error("job row was modified concurrently")]
    ConcurrentModification,
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("failed to serialize column payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job store path not configured")]
    MissingStore,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct SqliteJobStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteJobStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteJobStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteJobStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteJobStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteJobStore {
    pub fn builder() -> SqliteJobStoreBuilder {
        SqliteJobStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteJobStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
                StoreError::Open {
                    source,
                    path: self.path.clone(),
                }
            })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, job: &Job) -> StoreResult<()> {
        let conn = self.open()?;
        let profile = serde_json::to_string(&job.profile)?;
        let result = conn.execute(
            "INSERT INTO conversion_jobs (
                id, video_id, source_bucket, source_key, status, current_stage,
                stage_progress, overall_progress, profile, idempotency_key,
                workflow_id, priority, created_at, started_at, updated_at,
                finished_at, attempt, last_error_id, lock_version
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
            )",
            params![
                job.id.to_string(),
                job.video_id.map(|id| id.to_string()),
                &job.source_bucket,
                &job.source_key,
                job.status.as_str(),
                job.current_stage.map(|s| s.as_str()),
                job.stage_progress,
                job.overall_progress,
                profile,
                &job.idempotency_key,
                &job.workflow_id,
                job.priority,
                job.created_at.naive_utc(),
                job.started_at.map(|dt| dt.naive_utc()),
                job.updated_at.naive_utc(),
                job.finished_at.map(|dt| dt.naive_utc()),
                job.attempt,
                job.last_error_id.map(|id| id.to_string()),
                job.lock_version,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, message))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && message
                        .as_deref()
                        .is_some_and(|m| m.contains("idempotency")) =>
            {
                Err(StoreError::IdempotencyConflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM conversion_jobs WHERE id = ?1")?;
        let job = stmt
            .query_row([id.to_string()], job_from_row)
            .optional()?;
        Ok(job)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM conversion_jobs WHERE idempotency_key = ?1")?;
        let job = stmt.query_row([key], job_from_row).optional()?;
        Ok(job)
    }

    pub fn list_by_status(&self, status: JobStatus, limit: usize) -> StoreResult<Vec<Job>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM conversion_jobs
             WHERE status = ?1
             ORDER BY priority DESC, created_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((status.as_str(), limit as i64), job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_by_status(&self) -> StoreResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM conversion_jobs GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status, count as usize);
        }
        Ok(map)
    }

    /// Full-row update under optimistic locking. A concurrent writer wins
    /// the race; the loser observes `ConcurrentModification` and must
    /// re-read. On success `job.lock_version` is bumped in place.
    pub fn update(&self, job: &mut Job) -> StoreResult<()> {
        let conn = self.open()?;
        let profile = serde_json::to_string(&job.profile)?;
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE conversion_jobs SET
                video_id = ?2,
                source_bucket = ?3,
                source_key = ?4,
                status = ?5,
                current_stage = ?6,
                stage_progress = ?7,
                overall_progress = ?8,
                profile = ?9,
                idempotency_key = ?10,
                workflow_id = ?11,
                priority = ?12,
                started_at = ?13,
                updated_at = ?14,
                finished_at = ?15,
                attempt = ?16,
                last_error_id = ?17,
                lock_version = lock_version + 1
             WHERE id = ?1 AND lock_version = ?18",
            params![
                job.id.to_string(),
                job.video_id.map(|id| id.to_string()),
                &job.source_bucket,
                &job.source_key,
                job.status.as_str(),
                job.current_stage.map(|s| s.as_str()),
                job.stage_progress,
                job.overall_progress,
                profile,
                &job.idempotency_key,
                &job.workflow_id,
                job.priority,
                job.started_at.map(|dt| dt.naive_utc()),
                now.naive_utc(),
                job.finished_at.map(|dt| dt.naive_utc()),
                job.attempt,
                job.last_error_id.map(|id| id.to_string()),
                job.lock_version,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::ConcurrentModification);
        }
        job.lock_version += 1;
        job.updated_at = now;
        Ok(())
    }

    /// Idempotent progress write. Last writer wins for the stage fields;
    /// `overall_progress` never moves backwards across snapshots.
    pub fn update_progress(
        &self,
        id: Uuid,
        stage: Stage,
        stage_progress: u32,
        overall_progress: u32,
    ) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE conversion_jobs SET
                current_stage = ?2,
                stage_progress = ?3,
                overall_progress = MAX(overall_progress, ?4),
                updated_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                stage.as_str(),
                stage_progress.min(100),
                overall_progress.min(100),
                Utc::now().naive_utc(),
            ],
        )?;
        Ok(())
    }

    pub fn update_status(&self, id: Uuid, status: JobStatus) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE conversion_jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), Utc::now().naive_utc()],
        )?;
        Ok(())
    }

    pub fn set_started(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        conn.execute(
            "UPDATE conversion_jobs SET status = ?2, started_at = COALESCE(started_at, ?3), updated_at = ?3
             WHERE id = ?1",
            params![id.to_string(), JobStatus::Running.as_str(), now],
        )?;
        Ok(())
    }

    /// Terminal transition. Completion forces `overall_progress` to 100;
    /// an already-terminal row is left untouched (write-once).
    pub fn set_finished(&self, id: Uuid, status: JobStatus) -> StoreResult<()> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        conn.execute(
            "UPDATE conversion_jobs SET
                status = ?2,
                finished_at = ?3,
                updated_at = ?3,
                overall_progress = CASE WHEN ?2 = 'COMPLETED' THEN 100 ELSE overall_progress END
             WHERE id = ?1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELED')",
            params![id.to_string(), status.as_str(), now],
        )?;
        Ok(())
    }

    pub fn set_workflow_id(&self, id: Uuid, workflow_id: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE conversion_jobs SET workflow_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), workflow_id, Utc::now().naive_utc()],
        )?;
        Ok(())
    }

    /// Raises the cancel flag. Idempotent; read by the worker between
    /// stages.
    pub fn request_cancel(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE conversion_jobs SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELED')",
            params![id.to_string(), Utc::now().naive_utc()],
        )?;
        Ok(affected > 0)
    }

    pub fn cancel_requested(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.open()?;
        let requested: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM conversion_jobs WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(requested.unwrap_or(0) != 0)
    }

    /// Persists the durable per-stage result blob used for resume.
    pub fn save_stage_results(&self, id: Uuid, results: &serde_json::Value) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE conversion_jobs SET stage_results = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(results)?,
                Utc::now().naive_utc()
            ],
        )?;
        Ok(())
    }

    pub fn load_stage_results(&self, id: Uuid) -> StoreResult<Option<serde_json::Value>> {
        let conn = self.open()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT stage_results FROM conversion_jobs WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Inserts the error row and patches `last_error_id` and `attempt` on
    /// the owning job in the same transaction.
    pub fn record_error(&self, error: &ConversionError) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversion_errors (
                id, job_id, stage, class, code, message, details, attempt, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                error.id.to_string(),
                error.job_id.to_string(),
                error.stage.as_str(),
                error.class.as_str(),
                error.code.as_str(),
                &error.message,
                serde_json::to_string(&error.details)?,
                error.attempt,
                error.created_at.naive_utc(),
            ],
        )?;
        tx.execute(
            "UPDATE conversion_jobs SET last_error_id = ?2, attempt = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                error.job_id.to_string(),
                error.id.to_string(),
                error.attempt,
                Utc::now().naive_utc(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn errors_for_job(&self, job_id: Uuid) -> StoreResult<Vec<ConversionError>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM conversion_errors WHERE job_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([job_id.to_string()], error_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All artifact rows for a job land in one transaction; a crash
    /// mid-upload never leaves a partial index behind.
    pub fn create_artifacts(&self, artifacts: &[Artifact]) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for artifact in artifacts {
            tx.execute(
                "INSERT INTO conversion_artifacts (
                    id, job_id, type, bucket, key, size_bytes, checksum, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    artifact.id.to_string(),
                    artifact.job_id.to_string(),
                    artifact.artifact_type.as_str(),
                    &artifact.bucket,
                    &artifact.key,
                    artifact.size_bytes.map(|s| s as i64),
                    &artifact.checksum,
                    artifact.created_at.naive_utc(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn artifacts_for_job(&self, job_id: Uuid) -> StoreResult<Vec<Artifact>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM conversion_artifacts WHERE job_id = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map([job_id.to_string()], artifact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM conversion_jobs WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let created_at: NaiveDateTime = row.get("created_at")?;
    let started_at: Option<NaiveDateTime> = row.get("started_at")?;
    let updated_at: NaiveDateTime = row.get("updated_at")?;
    let finished_at: Option<NaiveDateTime> = row.get("finished_at")?;
    let profile_raw: String = row.get("profile")?;
    let profile: Profile = serde_json::from_str(&profile_raw).unwrap_or_default();
    Ok(Job {
        id: parse_uuid(row, "id")?,
        video_id: parse_optional_uuid(row, "video_id")?,
        source_bucket: row.get("source_bucket")?,
        source_key: row.get("source_key")?,
        status: row
            .get::<_, String>("status")?
            .parse()
            .unwrap_or(JobStatus::Queued),
        current_stage: row
            .get::<_, Option<String>>("current_stage")?
            .and_then(|s| Stage::from_str(&s).ok()),
        stage_progress: row.get::<_, i64>("stage_progress")? as u32,
        overall_progress: row.get::<_, i64>("overall_progress")? as u32,
        profile,
        idempotency_key: row.get("idempotency_key")?,
        workflow_id: row.get("workflow_id")?,
        priority: row.get("priority")?,
        created_at: Utc.from_utc_datetime(&created_at),
        started_at: started_at.map(|dt| Utc.from_utc_datetime(&dt)),
        updated_at: Utc.from_utc_datetime(&updated_at),
        finished_at: finished_at.map(|dt| Utc.from_utc_datetime(&dt)),
        attempt: row.get::<_, i64>("attempt")? as u32,
        last_error_id: parse_optional_uuid(row, "last_error_id")?,
        lock_version: row.get("lock_version")?,
    })
}

fn error_from_row(row: &Row<'_>) -> rusqlite::Result<ConversionError> {
    let created_at: NaiveDateTime = row.get("created_at")?;
    let details: Option<String> = row.get("details")?;
    Ok(ConversionError {
        id: parse_uuid(row, "id")?,
        job_id: parse_uuid(row, "job_id")?,
        stage: row
            .get::<_, String>("stage")?
            .parse()
            .unwrap_or(Stage::MetadataExtraction),
        class: row
            .get::<_, String>("class")?
            .parse()
            .unwrap_or(ErrorClass::Fatal),
        code: row
            .get::<_, String>("code")?
            .parse()
            .unwrap_or(ErrorCode::InternalError),
        message: row.get("message")?,
        details: details
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(serde_json::Value::Null),
        attempt: row.get::<_, i64>("attempt")? as u32,
        created_at: Utc.from_utc_datetime(&created_at),
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let created_at: NaiveDateTime = row.get("created_at")?;
    Ok(Artifact {
        id: parse_uuid(row, "id")?,
        job_id: parse_uuid(row, "job_id")?,
        artifact_type: row
            .get::<_, String>("type")?
            .parse()
            .unwrap_or(ArtifactType::Segment),
        bucket: row.get("bucket")?,
        key: row.get("key")?,
        size_bytes: row.get::<_, Option<i64>>("size_bytes")?.map(|s| s as u64),
        checksum: row.get("checksum")?,
        created_at: Utc.from_utc_datetime(&created_at),
    })
}

fn parse_uuid(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(column)?;
    Ok(Uuid::parse_str(&raw).unwrap_or_default())
}

fn parse_optional_uuid(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.and_then(|value| Uuid::parse_str(&value).ok()))
}
