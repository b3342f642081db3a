//! Problem-detail responses
//!
//! All error responses are RFC-7807 problem-detail JSON with a stable
//! machine `code`. Raw internal messages never leak to clients; the detail
//! text is composed per error class.

use axum::Json;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::{AppError, AuthError, DecisionError, FsError, OrchestratorError, StoreError};

/// Stable machine codes carried in problem bodies
pub mod codes {
    pub const PREPARING: &str = "PREPARING";
    pub const SESSION_STOPPED: &str = "SESSION_STOPPED";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const DECISION_AMBIGUOUS: &str = "DECISION_AMBIGUOUS";
    pub const INVARIANT_VIOLATION: &str = "INVARIANT_VIOLATION";
    pub const JOB_TIMEOUT_DEADLINE_EXCEEDED: &str = "JOB_TIMEOUT_DEADLINE_EXCEEDED";
    pub const CSRF_FORBIDDEN: &str = "CSRF_FORBIDDEN";
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const AUTH_INVALID: &str = "AUTH_INVALID";
    pub const SCOPE_MISSING: &str = "SCOPE_MISSING";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const PATH_ESCAPE: &str = "PATH_ESCAPE";
    pub const FILE_NOT_ALLOWED: &str = "FILE_NOT_ALLOWED";
    pub const RANGE_NOT_SATISFIABLE: &str = "RANGE_NOT_SATISFIABLE";
    pub const PROFILE_UNKNOWN: &str = "PROFILE_UNKNOWN";
    pub const SERVICE_REF_INVALID: &str = "SERVICE_REF_INVALID";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const VALIDATION: &str = "VALIDATION";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const STORE_ERROR: &str = "STORE_ERROR";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

/// RFC-7807 problem detail
#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
    #[serde(skip)]
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Problem {
    pub fn new(status: StatusCode, code: &str, title: &str) -> Self {
        Problem {
            problem_type: format!("https://xg2g.dev/problems/{}", code.to_ascii_lowercase()),
            title: title.to_string(),
            status: status.as_u16(),
            code: code.to_string(),
            detail: None,
            instance: None,
            extensions: BTreeMap::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.to_string(), value.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        (status, headers, Json(self)).into_response()
    }
}

impl From<&AppError> for Problem {
    fn from(error: &AppError) -> Self {
        match error {
            AppError::Auth(auth) => match auth {
                AuthError::MissingToken => Problem::new(
                    StatusCode::UNAUTHORIZED,
                    codes::AUTH_REQUIRED,
                    "Authentication required",
                ),
                AuthError::InvalidToken => Problem::new(
                    StatusCode::UNAUTHORIZED,
                    codes::AUTH_INVALID,
                    "Invalid bearer token",
                ),
                AuthError::MissingScope { required } => Problem::new(
                    StatusCode::FORBIDDEN,
                    codes::SCOPE_MISSING,
                    "Token lacks required scope",
                )
                .with_extension("required_scope", *required),
                AuthError::QueryToken => Problem::new(
                    StatusCode::FORBIDDEN,
                    codes::CSRF_FORBIDDEN,
                    "Token in query string is forbidden",
                ),
            },
            AppError::Decision(decision) => match decision {
                DecisionError::Ambiguous { missing } => Problem::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    codes::DECISION_AMBIGUOUS,
                    "Source probe is incomplete",
                )
                .with_extension(
                    "missing",
                    Value::Array(missing.iter().map(|m| Value::from(*m)).collect()),
                ),
                DecisionError::InvariantViolation { .. } => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::INVARIANT_VIOLATION,
                    "Decision invariant violated",
                ),
            },
            AppError::Orchestrator(orchestrator) => match orchestrator {
                OrchestratorError::SessionNotFound(id) => Problem::new(
                    StatusCode::NOT_FOUND,
                    codes::SESSION_NOT_FOUND,
                    "Unknown session",
                )
                .with_extension("session_id", id.as_str()),
                OrchestratorError::CircuitOpen => Problem::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    codes::CIRCUIT_OPEN,
                    "Start intents temporarily rejected",
                )
                .with_header(header::RETRY_AFTER, HeaderValue::from_static("30")),
                OrchestratorError::UnknownProfile(name) => Problem::new(
                    StatusCode::BAD_REQUEST,
                    codes::PROFILE_UNKNOWN,
                    "Unknown transcode profile",
                )
                .with_extension("profile", name.as_str()),
                OrchestratorError::InvalidServiceRef(_) => Problem::new(
                    StatusCode::BAD_REQUEST,
                    codes::SERVICE_REF_INVALID,
                    "Invalid service reference",
                ),
                OrchestratorError::Store(_) => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::STORE_ERROR,
                    "State store failure",
                ),
                OrchestratorError::Runner(_) => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::INTERNAL,
                    "Transcoder failure",
                ),
                OrchestratorError::Fs(_) => Problem::new(
                    StatusCode::FORBIDDEN,
                    codes::PATH_ESCAPE,
                    "Path rejected",
                ),
            },
            AppError::Fs(fs) => match fs {
                FsError::PathEscape { .. } => {
                    Problem::new(StatusCode::FORBIDDEN, codes::PATH_ESCAPE, "Path rejected")
                }
                FsError::InvalidName { .. } => Problem::new(
                    StatusCode::FORBIDDEN,
                    codes::PATH_ESCAPE,
                    "Invalid artifact name",
                ),
                FsError::Io { .. } => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::INTERNAL,
                    "Filesystem failure",
                ),
            },
            AppError::Store(store) => match store {
                StoreError::NotFound { .. } => {
                    Problem::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, "Record not found")
                }
                _ => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::STORE_ERROR,
                    "State store failure",
                ),
            },
            AppError::Upstream(_) => Problem::new(
                StatusCode::BAD_GATEWAY,
                codes::UPSTREAM_ERROR,
                "Upstream receiver failure",
            ),
            AppError::DeadlineExceeded { .. } => Problem::new(
                StatusCode::GATEWAY_TIMEOUT,
                codes::JOB_TIMEOUT_DEADLINE_EXCEEDED,
                "Deadline exceeded",
            ),
            AppError::ResourcePressure { .. } => Problem::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::RESOURCE_EXHAUSTED,
                "Resource watermark crossed",
            ),
            AppError::Validation { message } => {
                Problem::new(StatusCode::BAD_REQUEST, codes::VALIDATION, "Invalid request")
                    .with_detail(message.clone())
            }
            AppError::NotFound { resource, id } => {
                Problem::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, "Not found")
                    .with_detail(format!("{resource} {id} not found"))
            }
            AppError::Runner(_) | AppError::Fsm(_) | AppError::Configuration { .. }
            | AppError::Internal { .. } => Problem::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL,
                "Internal error",
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let problem = Problem::from(&self);
        if problem.status >= 500 {
            tracing::error!(error = %self, code = %problem.code, "request failed");
        } else {
            tracing::debug!(error = %self, code = %problem.code, "request rejected");
        }
        problem.into_response()
    }
}
