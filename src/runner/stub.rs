//! Stub runner for tests
//!
//! Produces a plausible session directory without an external binary: a
//! healthy stub writes a tmp playlist and one MPEG-TS segment, then runs
//! until its context is cancelled; a failing stub exits non-zero without
//! ever producing output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::RunnerError;
use crate::models::{ExitReason, ExitStatus, ProfileSpec};

use super::command::validate_session_id;
use super::{Runner, RunnerInput};

const STUB_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:1\n#EXTINF:2.000000,\nseg_000001.ts\n";

pub struct StubRunner {
    /// Delay before the tmp playlist appears; `None` never produces one
    playlist_delay: Option<Duration>,
    /// Exit spontaneously after this delay with this code
    exit_after: Option<(Duration, i32)>,
    log_lines: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    finished: Option<ExitStatus>,
}

impl StubRunner {
    /// Writes a playlist almost immediately and runs until cancelled
    pub fn healthy() -> Self {
        StubRunner {
            playlist_delay: Some(Duration::from_millis(20)),
            exit_after: None,
            log_lines: vec!["Output #0, hls, to 'index.m3u8.tmp':".to_string()],
            started_at: None,
            finished: None,
        }
    }

    /// Never writes a playlist, never exits on its own; the session sits in
    /// Preparing until cancelled
    pub fn idle() -> Self {
        StubRunner {
            playlist_delay: None,
            exit_after: None,
            log_lines: vec!["Opening 'pipe:0' for reading".to_string()],
            started_at: None,
            finished: None,
        }
    }

    /// Exits with `code` after `delay` without producing output
    pub fn failing(delay: Duration, code: i32) -> Self {
        StubRunner {
            playlist_delay: None,
            exit_after: Some((delay, code)),
            log_lines: vec![
                "pipe:0: Invalid data found when processing input".to_string(),
            ],
            started_at: None,
            finished: None,
        }
    }
}

#[async_trait]
impl Runner for StubRunner {
    async fn start(
        &mut self,
        _ctx: &CancellationToken,
        session_id: &str,
        _service_ref: &str,
        profile: &ProfileSpec,
        session_dir: &Path,
    ) -> Result<RunnerInput, RunnerError> {
        validate_session_id(session_id)?;
        self.started_at = Some(Utc::now());

        if let Some(delay) = self.playlist_delay {
            let dir = session_dir.to_path_buf();
            let ext = profile.segment_extension().to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // segment first so the promoted playlist never references
                // a missing file
                let mut segment = vec![0x47u8];
                segment.extend_from_slice(&[0u8; 187]);
                let _ = tokio::fs::write(dir.join(format!("seg_000001.{ext}")), &segment).await;
                let _ = tokio::fs::write(dir.join("index.m3u8.tmp"), STUB_PLAYLIST).await;
            });
        }

        Ok(Box::new(tokio::io::sink()))
    }

    async fn wait(&mut self, ctx: &CancellationToken) -> Result<ExitStatus, RunnerError> {
        if let Some(status) = &self.finished {
            return Ok(status.clone());
        }
        let started_at = self.started_at;

        let status = match self.exit_after {
            Some((delay, code)) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => ExitStatus {
                        code,
                        reason: if code == 0 { ExitReason::Clean } else { ExitReason::Error },
                        started_at,
                        ended_at: Utc::now(),
                    },
                    _ = ctx.cancelled() => ExitStatus {
                        code: 0,
                        reason: ExitReason::CtxCancel,
                        started_at,
                        ended_at: Utc::now(),
                    },
                }
            }
            None => {
                ctx.cancelled().await;
                ExitStatus {
                    code: 0,
                    reason: if started_at.is_some() {
                        ExitReason::CtxCancel
                    } else {
                        ExitReason::Never
                    },
                    started_at,
                    ended_at: Utc::now(),
                }
            }
        };

        self.finished = Some(status.clone());
        Ok(status)
    }

    async fn stop(&mut self) -> Result<(), RunnerError> {
        Ok(())
    }

    fn last_log_lines(&self, n: usize) -> Vec<String> {
        let skip = self.log_lines.len().saturating_sub(n);
        self.log_lines[skip..].to_vec()
    }
}

/// Factory producing healthy stubs
pub struct StubRunnerFactory;

impl super::RunnerFactory for StubRunnerFactory {
    fn create(&self) -> Box<dyn Runner> {
        Box::new(StubRunner::healthy())
    }
}

/// Factory producing stubs that fail shortly after start
pub struct FailingStubRunnerFactory {
    pub delay: Duration,
    pub code: i32,
}

impl super::RunnerFactory for FailingStubRunnerFactory {
    fn create(&self) -> Box<dyn Runner> {
        Box::new(StubRunner::failing(self.delay, self.code))
    }
}
