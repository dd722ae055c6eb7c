pub mod builder;
pub mod encryption;
pub mod probe;
pub mod runner;

use std::process::Output;

use tokio::process::Command;

pub use builder::{BuiltCommand, CommandBuilder};
pub use encryption::EncryptionInfo;
pub use probe::{ProbeError, ProbeResult, Prober};
pub use runner::{
    parse_progress_line, progress_percent, validate_output, FfmpegError, FfmpegResult, Progress,
    ProgressFn, Runner,
};

/// Indirection over subprocess execution so tests can substitute
/// executors without shelling out.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}
