//! HTTP middleware
//!
//! Request logging with hash-masked client addresses and baseline security
//! headers. Client IPs never reach the logs in the clear.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

/// Short stable pseudonym for a client address
pub fn mask_addr(addr: &SocketAddr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(addr.ip().to_string().as_bytes());
    let digest = hasher.finalize();
    format!(
        "ip-{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

pub async fn request_logging(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| mask_addr(addr))
        .unwrap_or_else(|| "ip-unknown".to_string());

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis();

    if status >= 500 {
        warn!(method = %method, path = %path, status, client = %client, duration_ms, "request");
    } else {
        info!(method = %method, path = %path, status, client = %client, duration_ms, "request");
    }
    response
}

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_addr_is_stable_and_opaque() {
        let a: SocketAddr = "192.0.2.10:51034".parse().unwrap();
        let b: SocketAddr = "192.0.2.10:9".parse().unwrap();
        let c: SocketAddr = "192.0.2.11:51034".parse().unwrap();
        // same host, any port -> same pseudonym
        assert_eq!(mask_addr(&a), mask_addr(&b));
        assert_ne!(mask_addr(&a), mask_addr(&c));
        assert!(!mask_addr(&a).contains("192"));
    }
}
