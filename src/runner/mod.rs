//! Transcoder runner
//!
//! Supervises exactly one external media-processing child per session. The
//! capability set is deliberately small (start, wait, stop, last log lines)
//! so implementations can be a subprocess (production), a library binding,
//! or a stub (tests).

use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::errors::RunnerError;
use crate::models::{ExitStatus, ProfileSpec};

pub mod command;
pub mod ffmpeg;
pub mod log_ring;
pub mod stub;

pub use command::{HlsCommandBuilder, validate_session_id};
pub use ffmpeg::FfmpegRunner;
pub use log_ring::LogRing;
pub use stub::{FailingStubRunnerFactory, StubRunner, StubRunnerFactory};

/// Byte sink feeding the child's stdin; the session worker pumps upstream
/// chunks into it.
pub type RunnerInput = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// Minimal runner capability set
#[async_trait]
pub trait Runner: Send {
    /// Launch the child for one session. Returns the input sink the worker
    /// feeds with upstream bytes.
    async fn start(
        &mut self,
        ctx: &CancellationToken,
        session_id: &str,
        service_ref: &str,
        profile: &ProfileSpec,
        session_dir: &Path,
    ) -> Result<RunnerInput, RunnerError>;

    /// Wait for the child to exit, reaping it. Cancelling `ctx` stops the
    /// child (soft terminate, then kill) and still returns its exit status.
    /// Idempotent once exited.
    async fn wait(&mut self, ctx: &CancellationToken) -> Result<ExitStatus, RunnerError>;

    /// Soft terminate, escalating to kill when the grace period expires
    async fn stop(&mut self) -> Result<(), RunnerError>;

    /// Tail of the stderr ring
    fn last_log_lines(&self, n: usize) -> Vec<String>;
}

/// Creates a fresh runner per session
pub trait RunnerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Runner>;
}

/// Production factory spawning ffmpeg children
pub struct FfmpegRunnerFactory {
    config: crate::config::RunnerConfig,
}

impl FfmpegRunnerFactory {
    pub fn new(config: crate::config::RunnerConfig) -> Self {
        FfmpegRunnerFactory { config }
    }
}

impl RunnerFactory for FfmpegRunnerFactory {
    fn create(&self) -> Box<dyn Runner> {
        Box::new(FfmpegRunner::new(self.config.clone()))
    }
}
