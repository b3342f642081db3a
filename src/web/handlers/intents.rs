//! Intent API and system surface
//!
//! Thin handlers over the orchestrator: start/stop intents, session
//! snapshots, health, and the decision debugging endpoint.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::{DecisionInput, decide};
use crate::errors::AppError;
use crate::models::{
    CapabilityProfile, Decision, DecisionPolicy, SessionSnapshot, SourceProbe,
};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    pub kind: IntentKind,
    pub service_ref: Option<String>,
    pub session_id: Option<String>,
    pub profile: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Start,
    Stop,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub session_id: String,
    pub state: String,
}

pub async fn post_intent(
    State(state): State<AppState>,
    Json(request): Json<IntentRequest>,
) -> Result<Response, AppError> {
    match request.kind {
        IntentKind::Start => {
            let service_ref = request
                .service_ref
                .as_deref()
                .ok_or_else(|| AppError::validation("start intent requires serviceRef"))?;
            let session_id = state
                .orchestrator
                .start_intent(
                    service_ref,
                    request.profile.as_deref(),
                    request.idempotency_key.as_deref(),
                )
                .await?;
            let snapshot = state.orchestrator.query(&session_id).await?;
            let body = IntentResponse {
                session_id,
                state: snapshot
                    .map(|s| s.state.as_str().to_string())
                    .unwrap_or_else(|| "new".to_string()),
            };
            Ok((StatusCode::CREATED, Json(body)).into_response())
        }
        IntentKind::Stop => {
            let session_id = request
                .session_id
                .ok_or_else(|| AppError::validation("stop intent requires sessionId"))?;
            state.orchestrator.stop_intent(&session_id).await?;
            let snapshot = state.orchestrator.query(&session_id).await?;
            let body = IntentResponse {
                session_id,
                state: snapshot
                    .map(|s| s.state.as_str().to_string())
                    .unwrap_or_else(|| "stopped".to_string()),
            };
            Ok((StatusCode::OK, Json(body)).into_response())
        }
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = state
        .orchestrator
        .query(&session_id)
        .await?
        .ok_or_else(|| {
            AppError::Orchestrator(crate::errors::OrchestratorError::SessionNotFound(session_id))
        })?;
    Ok(Json(snapshot))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.orchestrator.list())
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub release: &'static str,
    pub runtime: RuntimeHealth,
}

#[derive(Debug, Serialize)]
pub struct RuntimeHealth {
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub circuit_breaker: &'static str,
    pub zombie_workers: u64,
    pub metrics: crate::metrics::MetricsSnapshot,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    let metrics = state.metrics.snapshot();
    Json(Health {
        status: "ok",
        release: env!("CARGO_PKG_VERSION"),
        runtime: RuntimeHealth {
            uptime_seconds: state.started_at.elapsed().as_secs(),
            active_sessions: state.orchestrator.active_session_count(),
            circuit_breaker: state.orchestrator.breaker_state().as_str(),
            zombie_workers: metrics.zombie_workers,
            metrics,
        },
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub source: SourceProbe,
    pub capabilities: CapabilityProfile,
    #[serde(default)]
    pub policy: Option<DecisionPolicy>,
}

/// Operator debugging surface for the decision engine
pub async fn post_decision(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<Decision>, AppError> {
    // remember the capability document per device; cache misses never block
    // or fail a decision
    if let Some(ref device) = request.capabilities.device_type {
        if let Err(e) = state
            .store
            .cache_capabilities(device, &request.capabilities)
            .await
        {
            tracing::debug!(error = %e, "capability cache write failed");
        }
    }

    let policy = request.policy.unwrap_or_default();
    let request_id = format!("req-{}", Uuid::new_v4().simple());
    let decision = decide(
        DecisionInput {
            probe: &request.source,
            capabilities: &request.capabilities,
            policy: &policy,
            request_id: &request_id,
            direct_url: None,
            hls_url: None,
        },
        &state.metrics,
    )?;
    Ok(Json(decision))
}
