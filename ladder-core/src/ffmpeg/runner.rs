//! Subprocess execution with progress parsing, heartbeating, and
//! cooperative shutdown.
//!
//! The transcoder is spawned with `-progress pipe:1`, which emits
//! `key=value` lines terminated by `progress=end`. A reader task feeds
//! every parsed update to the caller's callback; a ticker re-delivers the
//! last known progress every 30 seconds so the orchestrator's heartbeat
//! stays fresh while the encoder is quiet. Cancellation sends SIGTERM and
//! escalates to a hard kill after a 10 second grace window.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::pipeline::CancelToken;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { source: io::Error, program: String },
    #[error("process exited with status {status:?}: {stderr}")]
    Failed {
        status: Option<i32>,
        stderr: String,
    },
    #[error("process exceeded wall-clock timeout of {0:?}")]
    Timeout(Duration),
    #[error("process canceled")]
    Canceled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("output file missing or empty: {0}")]
    InvalidOutput(PathBuf),
}

pub type FfmpegResult<T> = Result<T, FfmpegError>;

/// One snapshot of the transcoder's machine-readable progress stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub frame: u64,
    pub fps: f64,
    pub bitrate: String,
    pub total_size: u64,
    pub out_time: Duration,
    pub speed: f64,
    pub state: String,
}

impl Progress {
    pub fn finished(&self) -> bool {
        self.state == "end"
    }
}

pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Folds one `key=value` line into `progress`; returns whether anything
/// changed. Unknown keys are ignored.
pub fn parse_progress_line(line: &str, progress: &mut Progress) -> bool {
    let Some((key, value)) = line.split_once('=') else {
        return false;
    };
    let key = key.trim();
    let value = value.trim();
    match key {
        "frame" => match value.parse() {
            Ok(v) => {
                progress.frame = v;
                true
            }
            Err(_) => false,
        },
        "fps" => match value.parse() {
            Ok(v) => {
                progress.fps = v;
                true
            }
            Err(_) => false,
        },
        "bitrate" => {
            progress.bitrate = value.to_string();
            true
        }
        "total_size" => match value.parse() {
            Ok(v) => {
                progress.total_size = v;
                true
            }
            Err(_) => false,
        },
        // Both keys carry microseconds; out_time_ms is a historical
        // misnomer in the progress protocol.
        "out_time_us" | "out_time_ms" => match value.parse::<u64>() {
            Ok(v) => {
                progress.out_time = Duration::from_micros(v);
                true
            }
            Err(_) => false,
        },
        "speed" => match value.trim_end_matches('x').parse() {
            Ok(v) => {
                progress.speed = v;
                true
            }
            Err(_) => false,
        },
        "progress" => {
            progress.state = value.to_string();
            true
        }
        _ => false,
    }
}

/// Percentage of `total_sec` covered by `out_time`, clamped to 100.
pub fn progress_percent(out_time: Duration, total_sec: f64) -> u32 {
    if total_sec <= 0.0 {
        return 0;
    }
    let percent = out_time.as_secs_f64() / total_sec * 100.0;
    (percent as u32).min(100)
}

/// Post-condition check for every transcoder invocation: the primary
/// output exists and is non-empty.
pub fn validate_output(path: &Path) -> FfmpegResult<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.len() > 0 => Ok(()),
        _ => Err(FfmpegError::InvalidOutput(path.to_path_buf())),
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    binary: PathBuf,
    timeout: Duration,
    heartbeat_interval: Duration,
}

impl Runner {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Shrinks the heartbeat period; used by tests.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Runs the command to completion. Never writes to the child's stdin;
    /// the only side effects are the output files named in `args`.
    pub async fn run(
        &self,
        args: &[String],
        cancel: &CancelToken,
        progress_fn: Option<ProgressFn>,
    ) -> FfmpegResult<()> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FfmpegError::Spawn {
                source,
                program: self.binary.to_string_lossy().into_owned(),
            })?;

        let latest = Arc::new(Mutex::new(Progress::default()));

        let stdout = child.stdout.take();
        let reader_latest = latest.clone();
        let reader_fn = progress_fn.clone();
        let reader = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut progress = Progress::default();
            while let Ok(Some(line)) = lines.next_line().await {
                if parse_progress_line(&line, &mut progress) {
                    *reader_latest.lock().unwrap() = progress.clone();
                    if let Some(callback) = &reader_fn {
                        callback(&progress);
                    }
                }
            }
        });

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately, skip it
        let mut cancel = cancel.clone();

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ticker.tick() => {
                    if let Some(callback) = &progress_fn {
                        let snapshot = latest.lock().unwrap().clone();
                        callback(&snapshot);
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(program = %self.binary.display(), "canceling subprocess");
                    stop_gracefully(&mut child).await;
                    reader.abort();
                    return Err(FfmpegError::Canceled);
                }
                _ = &mut deadline => {
                    warn!(program = %self.binary.display(), timeout = ?self.timeout, "subprocess wall-clock exceeded");
                    let _ = child.kill().await;
                    reader.abort();
                    return Err(FfmpegError::Timeout(self.timeout));
                }
            }
        };

        let _ = reader.await;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(FfmpegError::Failed {
                status: status.code(),
                stderr,
            })
        }
    }
}

/// SIGTERM first; the hard kill lands only after the grace window.
async fn stop_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}
