//! WebUI serving
//!
//! The UI asset tree is built externally and served from disk as an opaque
//! blob. The contract here is small: every UI response carries a CSP header,
//! and the entry document is never cached.

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get_service;
use std::path::Path;
use tower_http::services::ServeDir;

const CSP: &str = "default-src 'self'; style-src 'self' 'unsafe-inline'; \
                   img-src 'self' data:; media-src 'self' blob:; connect-src 'self'";

pub fn service(dir: &Path) -> Router {
    let serve = ServeDir::new(dir).append_index_html_on_directories(true);
    Router::new()
        .fallback_service(get_service(serve))
        .layer(axum::middleware::from_fn(ui_headers))
}

async fn ui_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let is_html = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false);

    let headers = response.headers_mut();
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(CSP),
    );
    if is_html {
        headers.insert(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
    }
    response
}
