//! Session finite state machine
//!
//! One `Session` per playback attempt. Transitions are explicit method
//! calls, mutated only by the session's owning worker task; everything else
//! reads snapshots. No lock is held across I/O.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::errors::FsmError;
use crate::models::{ExitReason, ExitStatus, ProfileSpec, SessionSnapshot, SessionState};

pub mod publisher;

pub use publisher::PlaylistPublisher;

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    exit: Option<ExitStatus>,
    last_error: Option<String>,
    last_log_lines: Vec<String>,
}

/// One active (or recently stopped) playback session
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub service_ref: String,
    pub profile: ProfileSpec,
    /// Unique per session, always under the HLS root
    pub dir: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Cancelling this unwinds upstream, transcoder, and publisher
    pub ctx: CancellationToken,
    pub owner_context_id: String,
    inner: RwLock<SessionInner>,
    /// Death lines record why they cancelled so the terminal reason is
    /// `deadline`/`resource` instead of a bare `ctx_cancel`
    cancel_cause: Mutex<Option<ExitReason>>,
    cancelled_at: Mutex<Option<Instant>>,
}

impl Session {
    pub fn new(
        id: String,
        service_ref: String,
        profile: ProfileSpec,
        dir: PathBuf,
        ctx: CancellationToken,
        owner_context_id: String,
    ) -> Self {
        Session {
            id,
            service_ref,
            profile,
            dir,
            created_at: Utc::now(),
            ctx,
            owner_context_id,
            inner: RwLock::new(SessionInner {
                state: SessionState::New,
                started_at: None,
                ended_at: None,
                exit: None,
                last_error: None,
                last_log_lines: Vec::new(),
            }),
            cancel_cause: Mutex::new(None),
            cancelled_at: Mutex::new(None),
        }
    }

    fn transition(&self, to: SessionState) -> Result<(), FsmError> {
        let mut inner = self.inner.write().expect("session lock poisoned");
        let from = inner.state;
        if !Self::allowed(from, to) {
            return Err(FsmError::IllegalTransition { from, to });
        }
        inner.state = to;
        Ok(())
    }

    fn allowed(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (from, to),
            (New, Tuning)
                | (Tuning, Preparing)
                | (Preparing, Ready)
                | (New, Stopped)
                | (Tuning, Stopped)
                | (Preparing, Stopped)
                | (Ready, Stopped)
        )
    }

    /// New -> Tuning: the upstream connection is being opened
    pub fn begin_tuning(&self) -> Result<(), FsmError> {
        self.transition(SessionState::Tuning)
    }

    /// Tuning -> Preparing: the transcoder child is up
    pub fn begin_preparing(&self) -> Result<(), FsmError> {
        self.transition(SessionState::Preparing)?;
        self.inner.write().expect("session lock poisoned").started_at = Some(Utc::now());
        Ok(())
    }

    /// Preparing -> Ready: first playlist promotion happened
    pub fn mark_ready(&self) -> Result<(), FsmError> {
        self.transition(SessionState::Ready)
    }

    /// Terminal transition; records the exit status and final log tail.
    /// Once stopped no further transition is accepted.
    pub fn stop(
        &self,
        mut exit: ExitStatus,
        last_error: Option<String>,
        last_log_lines: Vec<String>,
    ) -> Result<(), FsmError> {
        // a death line that cancelled us owns the terminal reason
        if exit.reason == ExitReason::CtxCancel {
            if let Some(cause) = *self.cancel_cause.lock().expect("cancel cause poisoned") {
                exit.reason = cause;
            }
        }
        self.transition(SessionState::Stopped)?;
        let mut inner = self.inner.write().expect("session lock poisoned");
        inner.ended_at = Some(exit.ended_at);
        inner.exit = Some(exit);
        inner.last_error = last_error;
        inner.last_log_lines = last_log_lines;
        Ok(())
    }

    /// Cancel the session context (stop intent, shutdown)
    pub fn cancel(&self) {
        self.note_cancelled();
        self.ctx.cancel();
    }

    /// Record why the context is about to be cancelled, then cancel it
    pub fn cancel_with_cause(&self, cause: ExitReason) {
        *self.cancel_cause.lock().expect("cancel cause poisoned") = Some(cause);
        self.cancel();
    }

    fn note_cancelled(&self) {
        let mut cancelled_at = self.cancelled_at.lock().expect("cancelled_at poisoned");
        if cancelled_at.is_none() {
            *cancelled_at = Some(Instant::now());
        }
    }

    /// A worker that has not reached `Stopped` within the cleanup deadline
    /// after cancellation is a defect
    pub fn is_zombie(&self, cleanup_deadline: Duration) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.cancelled_at
            .lock()
            .expect("cancelled_at poisoned")
            .map(|at| at.elapsed() > cleanup_deadline)
            .unwrap_or(false)
    }

    pub fn record_error(&self, error: String) {
        self.inner.write().expect("session lock poisoned").last_error = Some(error);
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().expect("session lock poisoned").state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read().expect("session lock poisoned");
        SessionSnapshot {
            id: self.id.clone(),
            service_ref: self.service_ref.clone(),
            profile: self.profile.name.clone(),
            retains_output: self.profile.retains_output(),
            state: inner.state,
            created_at: self.created_at,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
            exit: inner.exit.clone(),
            last_error: inner.last_error.clone(),
            last_log_lines: inner.last_log_lines.clone(),
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.read().expect("session lock poisoned").exit.clone()
    }
}
