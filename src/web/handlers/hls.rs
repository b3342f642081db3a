//! HLS delivery surface
//!
//! Serves session playlists, media segments, and init segments with strict
//! content types, ETag/Range handling, and state-dependent status codes:
//! 503 while a session is preparing, 410 once a live session is gone, 404
//! for unknown sessions, 403 for anything that smells like a path escape.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::errors::{AppError, FsError};
use crate::fsutil;
use crate::models::SessionState;
use crate::web::AppState;
use crate::web::responses::{Problem, codes};

static HLS_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(index\.m3u8|seg_\d{6}\.(ts|m4s)|init\.mp4)$").expect("hls file regex")
});

/// Upper bound for the growing Retry-After during Preparing
const MAX_RETRY_AFTER_SECS: u32 = 5;

/// Session-state indicator carried on every HLS response
pub const SESSION_STATE_HEADER: HeaderName = HeaderName::from_static("x-session-state");

pub async fn serve(
    State(state): State<AppState>,
    Path((session_id, file)): Path<(String, String)>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    crate::runner::validate_session_id(&session_id).map_err(|_| {
        AppError::Fs(FsError::InvalidName {
            name: session_id.clone(),
        })
    })?;
    let file = fsutil::sanitize_name(&file)?;
    if !HLS_FILE_RE.is_match(&file) {
        return Err(AppError::not_found("file", &file));
    }

    let snapshot = state
        .orchestrator
        .query(&session_id)
        .await?
        .ok_or_else(|| {
            AppError::Orchestrator(crate::errors::OrchestratorError::SessionNotFound(
                session_id.clone(),
            ))
        })?;

    match snapshot.state {
        SessionState::New | SessionState::Tuning | SessionState::Preparing => {
            let retry_after = state.preparing_backoff.next(&session_id);
            return Ok(Problem::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::PREPARING,
                "Session is preparing",
            )
            .with_instance(format!("/hls/{session_id}/{file}"))
            .with_extension("recording_id", session_id.as_str())
            .with_extension("state", snapshot.state.as_str())
            .with_header(header::RETRY_AFTER, HeaderValue::from(retry_after))
            .with_header(
                SESSION_STATE_HEADER,
                HeaderValue::from_str(snapshot.state.as_str()).expect("state header"),
            )
            .into_response());
        }
        SessionState::Stopped => {
            state.preparing_backoff.clear(&session_id);
            let failed = snapshot
                .exit
                .as_ref()
                .map(|e| e.reason.is_failure())
                .unwrap_or(true);
            if failed || !snapshot.retains_output {
                return Ok(Problem::new(
                    StatusCode::GONE,
                    codes::SESSION_STOPPED,
                    "Session has stopped",
                )
                .with_instance(format!("/hls/{session_id}/{file}"))
                .with_extension("recording_id", session_id.as_str())
                .with_extension("state", snapshot.state.as_str())
                .into_response());
            }
            // DVR/VOD sessions keep serving their final playlist
        }
        SessionState::Ready => {
            state.preparing_backoff.clear(&session_id);
        }
    }

    let path = state
        .hls_root
        .join("sessions")
        .join(&session_id)
        .join(&file);
    let path = fsutil::validate_within_root(&path, &state.hls_root)?;

    serve_file(&path, &file, snapshot.state, &request_headers).await
}

async fn serve_file(
    path: &PathBuf,
    file: &str,
    session_state: SessionState,
    request_headers: &HeaderMap,
) -> Result<Response, AppError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found("file", file));
        }
        Err(source) => {
            return Err(AppError::Fs(FsError::Io {
                path: path.clone(),
                source,
            }));
        }
    };

    let size = metadata.len();
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    let etag = format!("\"{size:x}-{:x}\"", modified.timestamp());

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_ENCODING,
        HeaderValue::from_static("identity"),
    );
    headers.insert(header::ETAG, HeaderValue::from_str(&etag).expect("etag"));
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&http_date(&modified)).expect("http date"),
    );
    headers.insert(
        SESSION_STATE_HEADER,
        HeaderValue::from_str(session_state.as_str()).expect("state header"),
    );

    let (content_type, cache_control) = content_headers(file);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );

    if let Some(candidates) = request_headers.get(header::IF_NONE_MATCH) {
        if candidates
            .to_str()
            .map(|v| v.split(',').any(|c| c.trim() == etag))
            .unwrap_or(false)
        {
            return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
        }
    }

    let range = match request_headers.get(header::RANGE) {
        None => None,
        Some(raw) => {
            let raw = raw.to_str().unwrap_or("");
            match parse_single_range(raw, size) {
                Ok(range) => Some(range),
                Err(()) => {
                    return Ok(Problem::new(
                        StatusCode::RANGE_NOT_SATISFIABLE,
                        codes::RANGE_NOT_SATISFIABLE,
                        "Requested range not satisfiable",
                    )
                    .with_header(
                        header::CONTENT_RANGE,
                        HeaderValue::from_str(&format!("bytes */{size}")).expect("content range"),
                    )
                    .into_response());
                }
            }
        }
    };

    let body = tokio::fs::read(path)
        .await
        .map_err(|source| AppError::Fs(FsError::Io {
            path: path.clone(),
            source,
        }))?;

    match range {
        None => Ok((StatusCode::OK, headers, Body::from(body)).into_response()),
        Some((start, end)) => {
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{size}"))
                    .expect("content range"),
            );
            let slice = body[start as usize..=end as usize].to_vec();
            Ok((StatusCode::PARTIAL_CONTENT, headers, Body::from(slice)).into_response())
        }
    }
}

fn content_headers(file: &str) -> (&'static str, &'static str) {
    if file == "index.m3u8" {
        ("application/vnd.apple.mpegurl", "no-store")
    } else if file == "init.mp4" {
        // init segments are immutable for the session's lifetime
        ("video/mp4", "public, max-age=31536000, immutable")
    } else if file.ends_with(".m4s") {
        ("video/iso.segment", "public, max-age=10")
    } else {
        ("video/mp2t", "public, max-age=10")
    }
}

fn http_date(when: &DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse a single byte range. Multi-range and malformed headers are both
/// rejected; the caller answers 416.
fn parse_single_range(raw: &str, size: u64) -> Result<(u64, u64), ()> {
    let spec = raw.strip_prefix("bytes=").ok_or(())?;
    if spec.contains(',') || size == 0 {
        return Err(());
    }
    let (start_raw, end_raw) = spec.split_once('-').ok_or(())?;

    if start_raw.is_empty() {
        // suffix form: last N bytes
        let suffix: u64 = end_raw.parse().map_err(|_| ())?;
        if suffix == 0 {
            return Err(());
        }
        let start = size.saturating_sub(suffix);
        return Ok((start, size - 1));
    }

    let start: u64 = start_raw.parse().map_err(|_| ())?;
    let end: u64 = if end_raw.is_empty() {
        size - 1
    } else {
        end_raw.parse().map_err(|_| ())?
    };
    let end = end.min(size - 1);
    if start > end || start >= size {
        return Err(());
    }
    Ok((start, end))
}

/// Growing-but-bounded Retry-After state for preparing sessions
#[derive(Debug, Default)]
pub struct PreparingBackoff {
    polls: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl PreparingBackoff {
    pub fn next(&self, session_id: &str) -> u32 {
        let mut polls = self.polls.lock().expect("backoff mutex poisoned");
        let counter = polls.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        (*counter).min(MAX_RETRY_AFTER_SECS)
    }

    pub fn clear(&self, session_id: &str) {
        self.polls
            .lock()
            .expect("backoff mutex poisoned")
            .remove(session_id);
    }
}
