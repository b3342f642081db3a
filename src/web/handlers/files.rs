//! Static artifact surface
//!
//! Serves exactly three receiver artifacts out of the data directory:
//! `playlist.m3u`, `xmltv.xml`, `epg.xml`. Every other name, extension, or
//! traversal attempt is rejected.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::errors::{AppError, FsError};
use crate::fsutil;
use crate::web::AppState;
use crate::web::responses::{Problem, codes};

const ALLOWED: &[(&str, &str)] = &[
    ("playlist.m3u", "audio/x-mpegurl"),
    ("xmltv.xml", "application/xml"),
    ("epg.xml", "application/xml"),
];

pub async fn serve(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let name = fsutil::sanitize_name(&name)?;

    let Some((_, content_type)) = ALLOWED.iter().find(|(allowed, _)| *allowed == name) else {
        return Ok(Problem::new(
            StatusCode::FORBIDDEN,
            codes::FILE_NOT_ALLOWED,
            "Artifact name not allowed",
        )
        .with_extension("name", name.as_str())
        .into_response());
    };

    let path = state.data_dir.join(&name);
    let path = fsutil::validate_within_root(&path, &state.data_dir)?;

    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found("artifact", &name));
        }
        Err(source) => return Err(AppError::Fs(FsError::Io { path, source })),
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=60"),
            ),
        ],
        Body::from(body),
    )
        .into_response())
}
