//! Error type definitions for the xg2g streaming core
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::SessionState;

/// Upstream fetcher errors (receiver network/protocol failures)
///
/// These are the only errors the session worker treats as transient: the
/// worker recovers them with reconnect-and-backoff inside its own loop.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Receiver could not be reached at all (DNS, connect refused, TLS)
    #[error("upstream unreachable: {detail}")]
    Unreachable { detail: String },

    /// Connect or idle-read deadline expired
    #[error("upstream timeout after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Receiver rejected our credentials
    #[error("upstream authentication rejected (status {status})")]
    Auth { status: u16 },

    /// Receiver answered with something that is not an MPEG-TS stream
    #[error("upstream protocol error: {detail}")]
    Protocol { detail: String },

    /// Session context was cancelled while fetching; not a failure
    #[error("upstream fetch cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn from_reqwest(err: reqwest::Error, elapsed: Duration) -> Self {
        if err.is_timeout() {
            return UpstreamError::Timeout { elapsed };
        }
        if err.is_connect() {
            return UpstreamError::Unreachable {
                detail: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return UpstreamError::Auth {
                    status: status.as_u16(),
                };
            }
        }
        UpstreamError::Protocol {
            detail: err.to_string(),
        }
    }
}

/// Transcoder runner errors (child process lifecycle, argument build)
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Session id failed the safety regex; never reaches argument synthesis
    #[error("unsafe session id: {0:?}")]
    UnsafeSessionId(String),

    #[error("failed to spawn transcoder: {detail}")]
    Spawn { detail: String },

    #[error("transcoder exited with code {code}")]
    Exited { code: i32 },

    #[error("runner already started")]
    AlreadyStarted,

    #[error("runner not started")]
    NotStarted,

    #[error("transcoder i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session FSM errors
#[derive(Error, Debug)]
pub enum FsmError {
    /// Transition would regress or skip a state
    #[error("illegal session transition: {from} -> {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// Filesystem sandbox errors (path escape, artifact IO)
#[derive(Error, Debug)]
pub enum FsError {
    /// Path resolves outside its sandbox after symlink evaluation
    #[error("path escapes sandbox: {path}")]
    PathEscape { path: PathBuf },

    #[error("invalid artifact name: {name:?}")]
    InvalidName { name: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable state store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Only `sqlite` and `memory` are accepted; historical backends are
    /// the migration tool's business, never production code's
    #[error("unsupported storage backend {0:?} (supported: sqlite, memory)")]
    UnsupportedBackend(String),

    #[error("record not found: {table} with key {key}")]
    NotFound { table: &'static str, key: String },

    #[error("corrupted schema: {detail}")]
    CorruptedSchema { detail: String },
}

/// Capability & decision engine errors
#[derive(Error, Debug)]
pub enum DecisionError {
    /// A required source-probe field is missing; hardened fallback is deny
    #[error("decision ambiguous: missing {missing:?}")]
    Ambiguous { missing: Vec<&'static str> },

    /// A post-condition check failed; a malformed decision never ships
    #[error("decision invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

/// Authentication / authorization errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid bearer token")]
    InvalidToken,

    #[error("token lacks required scope {required:?}")]
    MissingScope { required: &'static str },

    /// Query-string token auth is forbidden by policy
    #[error("token in query string is forbidden")]
    QueryToken,
}

/// Session orchestrator errors (intent validation, admission control)
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("unknown session: {0}")]
    SessionNotFound(String),

    /// Circuit breaker is open; start intents fail fast
    #[error("start intents temporarily rejected (circuit open)")]
    CircuitOpen,

    #[error("unknown profile: {0:?}")]
    UnknownProfile(String),

    #[error("invalid service reference: {0:?}")]
    InvalidServiceRef(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Top-level application error type
///
/// Uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining from the subsystem enums.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("fsm error: {0}")]
    Fsm(#[from] FsmError),

    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Latency death line fired
    #[error("deadline exceeded: {detail}")]
    DeadlineExceeded { detail: String },

    /// Resource death line fired
    #[error("resource watermark crossed: {detail}")]
    ResourcePressure { detail: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
