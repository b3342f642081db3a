//! Session lifecycle types
//!
//! A session is one playback attempt: one upstream connection, one transcoder
//! child, one HLS directory. State transitions are monotonic along
//! `New -> Tuning -> Preparing -> Ready -> Stopped`; the FSM enforcing that
//! lives in `crate::session`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::profile::ProfileSpec;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    /// Upstream connection is being opened
    Tuning,
    /// Transcoder child is running, no valid playlist published yet
    Preparing,
    /// Playlist promoted at least once
    Ready,
    /// Terminal; carries an exit reason
    Stopped,
}

impl SessionState {
    /// Ordinal used to verify monotonic progress
    pub fn rank(self) -> u8 {
        match self {
            SessionState::New => 0,
            SessionState::Tuning => 1,
            SessionState::Preparing => 2,
            SessionState::Ready => 3,
            SessionState::Stopped => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Tuning => "tuning",
            SessionState::Preparing => "preparing",
            SessionState::Ready => "ready",
            SessionState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(SessionState::New),
            "tuning" => Some(SessionState::Tuning),
            "preparing" => Some(SessionState::Preparing),
            "ready" => Some(SessionState::Ready),
            "stopped" => Some(SessionState::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Child exited zero without cancellation
    Clean,
    /// Child exited non-zero while the context was still live
    Error,
    /// Session context was cancelled (stop intent or shutdown)
    CtxCancel,
    /// Latency death line: max lifetime exceeded
    Deadline,
    /// Resource death line: node watermark crossed
    Resource,
    /// Context was done before the child ever started
    Never,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Clean => "clean",
            ExitReason::Error => "error",
            ExitReason::CtxCancel => "ctx_cancel",
            ExitReason::Deadline => "deadline",
            ExitReason::Resource => "resource",
            ExitReason::Never => "never",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(ExitReason::Clean),
            "error" => Some(ExitReason::Error),
            "ctx_cancel" => Some(ExitReason::CtxCancel),
            "deadline" => Some(ExitReason::Deadline),
            "resource" => Some(ExitReason::Resource),
            "never" => Some(ExitReason::Never),
            _ => None,
        }
    }

    /// Failure exits always answer 410 on the HLS surface; non-failure
    /// exits still serve the final playlist when the profile retains it
    /// (DVR window or VOD).
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExitReason::Error | ExitReason::Deadline | ExitReason::Resource
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a session's transcoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    pub reason: ExitReason,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// Read-only view of a session handed to observers
///
/// Snapshots are taken without holding any lock across I/O; they may lag the
/// worker by one transition but never show an impossible state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub service_ref: String,
    pub profile: String,
    /// Whether the profile keeps segments after the session stops
    pub retains_output: bool,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Tail of the transcoder's stderr ring, redacted of credentials
    pub last_log_lines: Vec<String>,
}

/// Durable session record as persisted by the store
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub service_ref: String,
    pub profile: ProfileSpec,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub owner_context_id: String,
}
