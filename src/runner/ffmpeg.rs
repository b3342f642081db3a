//! FFmpeg child process supervision
//!
//! Runs one ffmpeg per session: stdin is piped from the upstream fetcher,
//! HLS output lands in the session directory, stderr is drained into a
//! bounded ring. State machine: NotStarted -> Running -> Exited.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::errors::RunnerError;
use crate::models::{ExitReason, ExitStatus, ProfileSpec};

use super::command::{HlsCommandBuilder, validate_session_id};
use super::log_ring::LogRing;
use super::{Runner, RunnerInput};

/// Probe the ffmpeg binary once at startup; returns the version string
pub async fn ffmpeg_version(command: &str) -> Option<String> {
    let output = Command::new(command).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().and_then(|line| {
        line.strip_prefix("ffmpeg version ")
            .map(|rest| rest.split_whitespace().next().unwrap_or(rest).to_string())
    })
}

enum RunnerState {
    NotStarted,
    Running {
        child: Child,
        started_at: DateTime<Utc>,
    },
    Exited {
        status: ExitStatus,
    },
}

pub struct FfmpegRunner {
    config: RunnerConfig,
    log_ring: Arc<LogRing>,
    state: RunnerState,
    session_id: Option<String>,
}

impl FfmpegRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let log_ring = Arc::new(LogRing::new(config.log_ring_lines));
        FfmpegRunner {
            config,
            log_ring,
            state: RunnerState::NotStarted,
            session_id: None,
        }
    }

    /// Soft terminate, escalate to kill after the grace period. Reaps the
    /// child either way.
    async fn terminate(child: &mut Child, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SIGTERM lets ffmpeg flush the playlist before exiting
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(pid, "transcoder ignored soft terminate, killing");
        }
        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill transcoder");
        }
    }

    fn derive_reason(code: i32, cancelled: bool) -> ExitReason {
        if code != 0 && !cancelled {
            ExitReason::Error
        } else if cancelled {
            ExitReason::CtxCancel
        } else {
            ExitReason::Clean
        }
    }
}

#[async_trait]
impl Runner for FfmpegRunner {
    async fn start(
        &mut self,
        ctx: &CancellationToken,
        session_id: &str,
        service_ref: &str,
        profile: &ProfileSpec,
        session_dir: &Path,
    ) -> Result<RunnerInput, RunnerError> {
        if !matches!(self.state, RunnerState::NotStarted) {
            return Err(RunnerError::AlreadyStarted);
        }
        validate_session_id(session_id)?;

        if ctx.is_cancelled() {
            self.state = RunnerState::Exited {
                status: ExitStatus {
                    code: -1,
                    reason: ExitReason::Never,
                    started_at: None,
                    ended_at: Utc::now(),
                },
            };
            return Err(RunnerError::Spawn {
                detail: "context cancelled before start".to_string(),
            });
        }

        let args = HlsCommandBuilder::new(profile, session_dir).build();
        debug!(session_id, ?args, "starting transcoder");

        let mut cmd = Command::new(&self.config.ffmpeg_command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            detail: format!("{}: {e}", self.config.ffmpeg_command),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let ring = self.log_ring.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ring.push(line);
                }
                debug!(session_id = %id, "transcoder stderr closed");
            });
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Spawn {
                detail: "transcoder stdin not piped".to_string(),
            })?;

        info!(
            session_id,
            service_ref,
            profile = %profile.name,
            pid = child.id(),
            "transcoder started"
        );

        self.session_id = Some(session_id.to_string());
        self.state = RunnerState::Running {
            child,
            started_at: Utc::now(),
        };
        Ok(Box::new(stdin))
    }

    async fn wait(&mut self, ctx: &CancellationToken) -> Result<ExitStatus, RunnerError> {
        let status = match std::mem::replace(&mut self.state, RunnerState::NotStarted) {
            RunnerState::NotStarted => {
                ctx.cancelled().await;
                ExitStatus {
                    code: -1,
                    reason: ExitReason::Never,
                    started_at: None,
                    ended_at: Utc::now(),
                }
            }
            RunnerState::Running {
                mut child,
                started_at,
            } => {
                let exit = tokio::select! {
                    result = child.wait() => result?,
                    _ = ctx.cancelled() => {
                        Self::terminate(&mut child, self.config.stop_grace).await;
                        child.wait().await?
                    }
                };
                let code = exit.code().unwrap_or(-1);
                let reason = Self::derive_reason(code, ctx.is_cancelled());
                ExitStatus {
                    code,
                    reason,
                    started_at: Some(started_at),
                    ended_at: Utc::now(),
                }
            }
            RunnerState::Exited { status } => status,
        };

        self.state = RunnerState::Exited {
            status: status.clone(),
        };
        Ok(status)
    }

    async fn stop(&mut self) -> Result<(), RunnerError> {
        if let RunnerState::Running { child, .. } = &mut self.state {
            Self::terminate(child, self.config.stop_grace).await;
        }
        Ok(())
    }

    fn last_log_lines(&self, n: usize) -> Vec<String> {
        self.log_ring.last(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_derivation_order() {
        // non-zero while ctx live is an error
        assert_eq!(FfmpegRunner::derive_reason(1, false), ExitReason::Error);
        // cancellation wins over the exit code once the ctx is done
        assert_eq!(FfmpegRunner::derive_reason(1, true), ExitReason::CtxCancel);
        assert_eq!(FfmpegRunner::derive_reason(0, true), ExitReason::CtxCancel);
        assert_eq!(FfmpegRunner::derive_reason(0, false), ExitReason::Clean);
    }

    #[tokio::test]
    async fn wait_before_start_reports_never() {
        let mut runner = FfmpegRunner::new(RunnerConfig::default());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let status = runner.wait(&ctx).await.unwrap();
        assert_eq!(status.reason, ExitReason::Never);
        assert!(status.started_at.is_none());
    }

    #[tokio::test]
    async fn start_refuses_unsafe_session_id() {
        let mut runner = FfmpegRunner::new(RunnerConfig::default());
        let ctx = CancellationToken::new();
        let result = runner
            .start(
                &ctx,
                "../escape",
                "1:0:19:EF75:3F9:1:C00000:0:0:0",
                &ProfileSpec::builtin_live(),
                Path::new("/tmp"),
            )
            .await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected start() to reject an unsafe session id"),
        };
        assert!(matches!(err, RunnerError::UnsafeSessionId(_)));
    }
}
