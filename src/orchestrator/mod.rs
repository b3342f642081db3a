//! Session orchestrator
//!
//! Owns the session registry and the public intent API. Each session gets
//! one worker task; all state mutation for a session happens in that task.
//! The registry mutex guards map mutation only and is never held across I/O.

use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod circuit_breaker;
pub mod death_lines;
pub mod events;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use death_lines::DeathLineWatchdog;
pub use events::{EventBus, SessionEvent};

use crate::config::Config;
use crate::errors::{OrchestratorError, UpstreamError};
use crate::fsutil;
use crate::metrics::Metrics;
use crate::models::{
    ExitReason, ExitStatus, ProfileSpec, SessionRecord, SessionSnapshot, SessionState,
};
use crate::runner::{RunnerFactory, RunnerInput};
use crate::session::{PlaylistPublisher, Session};
use crate::store::Store;
use crate::upstream::{UpstreamConnection, UpstreamFetcher};

/// Session registry: one mutex, map mutation only
pub type Registry = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// Enigma2 service references are colon-separated hex groups
static SERVICE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9:._-]{1,128}$").expect("service ref regex"));

/// A connection this old is considered healthy and resets the backoff ladder
const HEALTHY_UPTIME: Duration = Duration::from_secs(10);

pub struct SessionOrchestrator {
    store: Store,
    fetcher: UpstreamFetcher,
    runner_factory: Arc<dyn RunnerFactory>,
    metrics: Arc<Metrics>,
    events: EventBus,
    registry: Registry,
    breaker: CircuitBreaker,
    root_ctx: CancellationToken,
    hls_root: PathBuf,
    config: Config,
}

impl SessionOrchestrator {
    pub fn new(
        config: Config,
        store: Store,
        fetcher: UpstreamFetcher,
        runner_factory: Arc<dyn RunnerFactory>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let orchestrator = Arc::new(SessionOrchestrator {
            store,
            fetcher,
            runner_factory,
            metrics: metrics.clone(),
            events: EventBus::new(),
            registry: registry.clone(),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            root_ctx: CancellationToken::new(),
            hls_root: config.storage.hls_root.clone(),
            config,
        });
        orchestrator.spawn_watchdog();
        orchestrator.spawn_lease_purger();
        orchestrator
    }

    fn spawn_watchdog(&self) {
        let watchdog = DeathLineWatchdog::new(
            self.registry.clone(),
            self.config.death_lines.clone(),
            self.config.sessions.clone(),
            self.hls_root.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(watchdog.run(self.root_ctx.clone()));
    }

    fn spawn_lease_purger(&self) {
        let store = self.store.clone();
        let root = self.root_ctx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = store.purge_expired_leases().await {
                    warn!(error = %e, "lease purge failed");
                }
            }
        });
    }

    /// Start a playback session. Idempotent on `idempotency_key` within its
    /// TTL: the existing session id is returned instead of a new session.
    pub async fn start_intent(
        self: &Arc<Self>,
        service_ref: &str,
        profile_name: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        if !self.breaker.allow_request() {
            self.metrics
                .intents_rejected_circuit_open
                .fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::CircuitOpen);
        }

        if !SERVICE_REF_RE.is_match(service_ref) {
            return Err(OrchestratorError::InvalidServiceRef(
                service_ref.to_string(),
            ));
        }

        let profile = self.resolve_profile(profile_name)?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = self.store.get_lease(key).await? {
                if self.lookup(&existing).is_some()
                    || self.store.get_session(&existing).await?.is_some()
                {
                    debug!(key, session_id = %existing, "start intent deduplicated by lease");
                    return Ok(existing);
                }
            }
        }

        // creation failures count against the breaker; successes are only
        // recorded once the worker proves the session out
        let result = self
            .create_session(service_ref, profile, idempotency_key)
            .await;
        if result.is_err() {
            self.breaker.record_failure();
        }
        result
    }

    async fn create_session(
        self: &Arc<Self>,
        service_ref: &str,
        profile: ProfileSpec,
        idempotency_key: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let session_id = format!("sess-{}", Uuid::new_v4().simple());
        crate::runner::validate_session_id(&session_id)?;

        let session_dir = self.hls_root.join("sessions").join(&session_id);
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(|source| crate::errors::FsError::Io {
                path: session_dir.clone(),
                source,
            })?;
        fsutil::validate_within_root(&session_dir, &self.hls_root)?;

        let session = Arc::new(Session::new(
            session_id.clone(),
            service_ref.to_string(),
            profile,
            session_dir,
            self.root_ctx.child_token(),
            format!("intent-{}", Uuid::new_v4().simple()),
        ));

        let record = SessionRecord {
            id: session.id.clone(),
            service_ref: session.service_ref.clone(),
            profile: session.profile.clone(),
            state: SessionState::New,
            created_at: session.created_at,
            started_at: None,
            ended_at: None,
            exit_reason: None,
            exit_code: None,
            last_error: None,
            owner_context_id: session.owner_context_id.clone(),
        };
        self.store.create_session(&record).await?;

        if let Some(key) = idempotency_key {
            self.store
                .put_lease(key, &session_id, self.config.sessions.idempotency_ttl)
                .await?;
        }

        self.registry
            .lock()
            .expect("registry mutex poisoned")
            .insert(session_id.clone(), session.clone());

        self.metrics.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.events.publish(SessionEvent::SessionStarted {
            session_id: session_id.clone(),
        });
        info!(session_id = %session_id, service_ref = %session.service_ref, "session created");

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_worker(session).await;
        });

        Ok(session_id)
    }

    fn resolve_profile(
        &self,
        profile_name: Option<&str>,
    ) -> Result<ProfileSpec, OrchestratorError> {
        let mut profile = match profile_name {
            Some(name) => self
                .config
                .sessions
                .profile(name)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownProfile(name.to_string()))?,
            None => self
                .config
                .sessions
                .profiles
                .first()
                .cloned()
                .unwrap_or_else(ProfileSpec::builtin_live),
        };
        // operator-level DVR window applies when the profile has none
        if profile.dvr_window_sec == 0 && !profile.vod {
            profile.dvr_window_sec = self.config.sessions.dvr_window_sec;
        }
        Ok(profile)
    }

    /// Cancel the session context and wait for the terminal state
    pub async fn stop_intent(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let Some(session) = self.lookup(session_id) else {
            // already destroyed but persisted: the stop is a no-op
            if self.store.get_session(session_id).await?.is_some() {
                return Ok(());
            }
            return Err(OrchestratorError::SessionNotFound(session_id.to_string()));
        };

        session.cancel();
        let deadline = tokio::time::Instant::now()
            + self.config.sessions.cleanup_deadline
            + Duration::from_secs(5);
        while !session.state().is_terminal() {
            if tokio::time::Instant::now() >= deadline {
                warn!(session_id, "stop intent timed out waiting for terminal state");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry
            .lock()
            .expect("registry mutex poisoned")
            .get(session_id)
            .cloned()
    }

    /// Snapshot of a live session, falling back to the durable record for
    /// sessions already destroyed
    pub async fn query(&self, session_id: &str) -> Result<Option<SessionSnapshot>, OrchestratorError> {
        if let Some(session) = self.lookup(session_id) {
            return Ok(Some(session.snapshot()));
        }
        Ok(self
            .store
            .get_session(session_id)
            .await?
            .map(snapshot_from_record))
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = {
            let registry = self.registry.lock().expect("registry mutex poisoned");
            registry.values().cloned().collect()
        };
        sessions.iter().map(|s| s.snapshot()).collect()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn active_session_count(&self) -> usize {
        self.registry.lock().expect("registry mutex poisoned").len()
    }

    /// Cancel everything and wait for workers to unwind
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.root_ctx.cancel();
        let deadline = tokio::time::Instant::now()
            + self.config.sessions.cleanup_deadline
            + self.config.runner.stop_grace;
        loop {
            let all_terminal = {
                let registry = self.registry.lock().expect("registry mutex poisoned");
                registry.values().all(|s| s.state().is_terminal())
            };
            if all_terminal || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// One worker per session: drives the FSM, then records the exit and
    /// lingers for the grace interval before destroying the session.
    async fn run_worker(self: Arc<Self>, session: Arc<Session>) {
        let (status, last_error, log_lines) = self.drive(&session).await;

        let was_ready = session.state() == SessionState::Ready;
        if let Err(e) = session.stop(status.clone(), last_error.clone(), log_lines) {
            error!(session_id = %session.id, error = %e, "terminal transition failed");
        }
        // the stored exit carries any death-line cause override
        let final_exit = session.exit_status().unwrap_or(status);

        if let Err(e) = self
            .store
            .record_exit(&session.id, &final_exit, last_error.as_deref())
            .await
        {
            error!(session_id = %session.id, error = %e, "failed to persist exit");
        }

        if was_ready || !final_exit.reason.is_failure() {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }

        self.metrics.sessions_stopped.fetch_add(1, Ordering::Relaxed);
        self.events.publish(SessionEvent::SessionStopped {
            session_id: session.id.clone(),
            reason: final_exit.reason,
        });
        info!(
            session_id = %session.id,
            reason = %final_exit.reason,
            code = final_exit.code,
            "session stopped"
        );

        // linger through the grace interval, then destroy
        tokio::time::sleep(self.config.sessions.grace).await;
        self.registry
            .lock()
            .expect("registry mutex poisoned")
            .remove(&session.id);
        if !session.profile.retains_output() {
            if let Err(e) = tokio::fs::remove_dir_all(&session.dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(session_id = %session.id, error = %e, "session dir cleanup failed");
                }
            }
        }
    }

    /// Tuning -> Preparing -> (Ready) -> child exit. Returns the exit status
    /// plus error context for the terminal record.
    async fn drive(
        &self,
        session: &Arc<Session>,
    ) -> (ExitStatus, Option<String>, Vec<String>) {
        let ctx = session.ctx.clone();

        if let Err(e) = session.begin_tuning() {
            return (synthetic_exit(ExitReason::Error), Some(e.to_string()), vec![]);
        }
        self.persist_state(&session.id, SessionState::Tuning, false).await;

        // first upstream connection; transient failures reconnect with
        // backoff until the context dies
        let mut backoff = self.fetcher.backoff();
        let connection = loop {
            match self.fetcher.open(&ctx, &session.service_ref).await {
                Ok(connection) => break connection,
                Err(UpstreamError::Cancelled) => {
                    return (synthetic_exit(ExitReason::Never), None, vec![]);
                }
                Err(e @ UpstreamError::Auth { .. }) => {
                    return (synthetic_exit(ExitReason::Error), Some(e.to_string()), vec![]);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        session_id = %session.id,
                        error = %e,
                        retry_in = ?delay,
                        "upstream open failed"
                    );
                    session.record_error(e.to_string());
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return (synthetic_exit(ExitReason::Never), Some(e.to_string()), vec![]);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let mut runner = self.runner_factory.create();
        let input = match runner
            .start(&ctx, &session.id, &session.service_ref, &session.profile, &session.dir)
            .await
        {
            Ok(input) => input,
            Err(e) => {
                let reason = if ctx.is_cancelled() {
                    ExitReason::Never
                } else {
                    ExitReason::Error
                };
                return (
                    synthetic_exit(reason),
                    Some(e.to_string()),
                    runner.last_log_lines(self.config.runner.log_ring_lines),
                );
            }
        };

        if let Err(e) = session.begin_preparing() {
            return (synthetic_exit(ExitReason::Error), Some(e.to_string()), vec![]);
        }
        self.persist_state(&session.id, SessionState::Preparing, true).await;

        // publisher + ready handler
        let (ready_tx, ready_rx) = oneshot::channel();
        let publisher = PlaylistPublisher::new(session.dir.clone(), self.metrics.clone());
        tokio::spawn(publisher.run(ctx.clone(), ready_tx));
        self.spawn_ready_handler(session.clone(), ready_rx);

        // pump upstream bytes into the child until either side dies
        let pump = tokio::spawn(Self::pump_upstream(
            self.fetcher.clone(),
            session.clone(),
            connection,
            input,
            self.metrics.clone(),
        ));

        let status = match runner.wait(&ctx).await {
            Ok(status) => status,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "runner wait failed");
                synthetic_exit(ExitReason::Error)
            }
        };
        pump.abort();

        let log_lines = runner.last_log_lines(self.config.runner.log_ring_lines);
        let mut last_error = session.snapshot().last_error;
        if status.reason == ExitReason::Error && last_error.is_none() {
            last_error = log_lines.last().cloned();
        }
        (status, last_error, log_lines)
    }

    fn spawn_ready_handler(&self, session: Arc<Session>, ready_rx: oneshot::Receiver<()>) {
        let store = self.store.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return; // publisher stopped without promoting
            }
            match session.mark_ready() {
                Ok(()) => {
                    if let Err(e) = store
                        .update_session_state(&session.id, SessionState::Ready, None)
                        .await
                    {
                        warn!(session_id = %session.id, error = %e, "ready state persist failed");
                    }
                    events.publish(SessionEvent::SessionReady {
                        session_id: session.id.clone(),
                    });
                    info!(session_id = %session.id, "session ready");
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "ready transition refused"),
            }
        });
    }

    async fn persist_state(&self, id: &str, state: SessionState, mark_started: bool) {
        let started_at = mark_started.then(Utc::now);
        if let Err(e) = self.store.update_session_state(id, state, started_at).await {
            warn!(session_id = %id, error = %e, "state persist failed");
        }
    }

    /// Copy upstream chunks into the child's stdin, reconnecting the
    /// upstream with backoff on transient failures.
    async fn pump_upstream(
        fetcher: UpstreamFetcher,
        session: Arc<Session>,
        mut connection: UpstreamConnection,
        mut input: RunnerInput,
        metrics: Arc<Metrics>,
    ) {
        let ctx = session.ctx.clone();
        let mut backoff = fetcher.backoff();

        loop {
            match connection.next_chunk(&ctx).await {
                Ok(Some(chunk)) => {
                    if let Err(e) = input.write_all(&chunk).await {
                        debug!(session_id = %session.id, error = %e, "transcoder stdin closed");
                        return;
                    }
                    if connection.uptime() > HEALTHY_UPTIME {
                        backoff.reset();
                    }
                }
                Err(UpstreamError::Cancelled) => return,
                Err(e @ UpstreamError::Auth { .. }) => {
                    warn!(session_id = %session.id, error = %e, "upstream auth failure, stopping session");
                    session.record_error(e.to_string());
                    session.cancel_with_cause(ExitReason::Error);
                    return;
                }
                Ok(None) | Err(_) => {
                    // transient: reconnect with bounded backoff
                    loop {
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = ctx.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        match fetcher.open(&ctx, &session.service_ref).await {
                            Ok(fresh) => {
                                metrics.upstream_reconnects.fetch_add(1, Ordering::Relaxed);
                                debug!(session_id = %session.id, "upstream reconnected");
                                connection = fresh;
                                break;
                            }
                            Err(UpstreamError::Cancelled) => return,
                            Err(e @ UpstreamError::Auth { .. }) => {
                                session.record_error(e.to_string());
                                session.cancel_with_cause(ExitReason::Error);
                                return;
                            }
                            Err(e) => {
                                session.record_error(e.to_string());
                            }
                        }
                    }
                }
            }
        }
    }
}

fn synthetic_exit(reason: ExitReason) -> ExitStatus {
    ExitStatus {
        code: -1,
        reason,
        started_at: None,
        ended_at: Utc::now(),
    }
}

fn snapshot_from_record(record: SessionRecord) -> SessionSnapshot {
    let exit = record.exit_reason.map(|reason| ExitStatus {
        code: record.exit_code.unwrap_or(-1),
        reason,
        started_at: record.started_at,
        ended_at: record.ended_at.unwrap_or(record.created_at),
    });
    SessionSnapshot {
        id: record.id,
        service_ref: record.service_ref,
        profile: record.profile.name.clone(),
        retains_output: record.profile.retains_output(),
        state: record.state,
        created_at: record.created_at,
        started_at: record.started_at,
        ended_at: record.ended_at,
        exit,
        last_error: record.last_error,
        last_log_lines: Vec::new(),
    }
}
