//! Per-job scratch space on local disk.
//!
//! Layout under the configured root:
//! `{job_id}/input`, `meta`, `transcoded/{tier}`, `subtitles`, `thumbs`,
//! `hls/{tier}`, plus a `.lock` sentinel asserting that an orchestrator
//! owns the tree. Unlocked trees older than the sweep age are orphans.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::EncodingTier;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> WorkspaceError {
    let path = path.into();
    move |source| WorkspaceError::Io { source, path }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    job_id: Uuid,
    root: PathBuf,
}

impl Workspace {
    pub fn new(workdir_root: impl AsRef<Path>, job_id: Uuid) -> Self {
        Self {
            job_id,
            root: workdir_root.as_ref().join(job_id.to_string()),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.input_dir().join(filename)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn meta_path(&self, filename: &str) -> PathBuf {
        self.meta_dir().join(filename)
    }

    pub fn transcoded_dir(&self, tier: EncodingTier) -> PathBuf {
        self.root.join("transcoded").join(tier.as_str())
    }

    pub fn subtitles_dir(&self) -> PathBuf {
        self.root.join("subtitles")
    }

    pub fn subtitle_path(&self, lang: &str) -> PathBuf {
        self.subtitles_dir().join(format!("{lang}.vtt"))
    }

    pub fn thumbs_dir(&self) -> PathBuf {
        self.root.join("thumbs")
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.root.join("hls")
    }

    pub fn tier_hls_dir(&self, tier: EncodingTier) -> PathBuf {
        self.hls_dir().join(tier.as_str())
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Creates the full directory tree and the lock sentinel. Safe to
    /// call again for the same job.
    pub fn create(&self) -> WorkspaceResult<()> {
        for dir in [
            self.input_dir(),
            self.meta_dir(),
            self.root.join("transcoded"),
            self.subtitles_dir(),
            self.thumbs_dir(),
            self.hls_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        let lock = self.lock_path();
        fs::write(&lock, b"").map_err(io_err(&lock))?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_path().is_file()
    }

    pub fn cleanup(&self) -> WorkspaceResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Io {
                source,
                path: self.root.clone(),
            }),
        }
    }

    /// Total bytes on disk under this workspace, for telemetry.
    pub fn disk_usage(&self) -> WorkspaceResult<u64> {
        fn walk(dir: &Path) -> io::Result<u64> {
            let mut total = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if metadata.is_dir() {
                    total += walk(&entry.path())?;
                } else {
                    total += metadata.len();
                }
            }
            Ok(total)
        }
        walk(&self.root).map_err(io_err(&self.root))
    }
}

/// Removes unlocked workspace directories whose mtime is older than
/// `max_age`. Only UUID-named directories are considered; anything else
/// under the root is left alone. Returns the number of trees removed.
pub fn sweep_orphans(workdir_root: impl AsRef<Path>, max_age: Duration) -> WorkspaceResult<usize> {
    let root = workdir_root.as_ref();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(WorkspaceError::Io {
                source,
                path: root.to_path_buf(),
            })
        }
    };

    let cutoff = SystemTime::now() - max_age;
    let mut removed = 0;

    for entry in entries {
        let entry = entry.map_err(io_err(root))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if Uuid::parse_str(name).is_err() {
            continue;
        }
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let modified = metadata.modified().map_err(io_err(&path))?;
        if modified > cutoff {
            continue;
        }
        if path.join(".lock").is_file() {
            debug!(workspace = %path.display(), "skipping locked workspace");
            continue;
        }
        if let Err(err) = fs::remove_dir_all(&path) {
            warn!(workspace = %path.display(), error = %err, "failed to remove orphan workspace");
            continue;
        }
        removed += 1;
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_is_idempotent_and_locks() {
        let root = tempdir().unwrap();
        let ws = Workspace::new(root.path(), Uuid::new_v4());
        ws.create().unwrap();
        ws.create().unwrap();
        assert!(ws.exists());
        assert!(ws.is_locked());
        assert!(ws.input_dir().is_dir());
        assert!(ws.hls_dir().is_dir());
    }

    #[test]
    fn cleanup_removes_tree_and_tolerates_missing() {
        let root = tempdir().unwrap();
        let ws = Workspace::new(root.path(), Uuid::new_v4());
        ws.create().unwrap();
        fs::write(ws.input_path("source.mp4"), b"data").unwrap();
        ws.cleanup().unwrap();
        assert!(!ws.exists());
        ws.cleanup().unwrap();
    }

    #[test]
    fn disk_usage_counts_files() {
        let root = tempdir().unwrap();
        let ws = Workspace::new(root.path(), Uuid::new_v4());
        ws.create().unwrap();
        fs::write(ws.input_path("a"), vec![0u8; 100]).unwrap();
        fs::write(ws.meta_path("b"), vec![0u8; 50]).unwrap();
        assert!(ws.disk_usage().unwrap() >= 150);
    }

    #[test]
    fn sweep_skips_locked_and_recent_and_non_uuid() {
        let root = tempdir().unwrap();

        let locked = Workspace::new(root.path(), Uuid::new_v4());
        locked.create().unwrap();

        let unlocked = Workspace::new(root.path(), Uuid::new_v4());
        unlocked.create().unwrap();
        fs::remove_file(unlocked.root().join(".lock")).unwrap();

        fs::create_dir(root.path().join("not-a-uuid")).unwrap();

        // Zero max age makes every unlocked workspace an orphan.
        let removed = sweep_orphans(root.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(locked.exists());
        assert!(!unlocked.exists());
        assert!(root.path().join("not-a-uuid").is_dir());

        // A generous age keeps fresh workspaces around.
        let fresh = Workspace::new(root.path(), Uuid::new_v4());
        fresh.create().unwrap();
        fs::remove_file(fresh.root().join(".lock")).unwrap();
        let removed = sweep_orphans(root.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }
}
