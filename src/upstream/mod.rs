//! Upstream fetcher
//!
//! Pulls the MPEG-TS byte stream from the receiver's stream port as one
//! long-lived HTTP GET. Receiver firmwares are quirky: some reject unknown
//! user agents, and some stall unless the client asks for Icecast metadata.
//! Both headers are part of the protocol contract here, not cosmetics.
//!
//! The fetcher never buffers beyond the in-flight chunk; back pressure comes
//! from the consumer pulling `next_chunk`.

use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use reqwest::header;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ReceiverConfig, UpstreamConfig};
use crate::errors::{AppError, UpstreamError};

type ByteStream = Pin<Box<dyn futures::Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Opens and supervises upstream connections to the receiver
#[derive(Clone)]
pub struct UpstreamFetcher {
    client: reqwest::Client,
    upstream: UpstreamConfig,
    receiver: ReceiverConfig,
}

impl UpstreamFetcher {
    pub fn new(upstream: UpstreamConfig, receiver: ReceiverConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(upstream.connect_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build upstream client: {e}")))?;

        Ok(UpstreamFetcher {
            client,
            upstream,
            receiver,
        })
    }

    /// Stream URL for a service reference on the receiver's stream port
    pub fn stream_url(&self, service_ref: &str) -> Result<Url, UpstreamError> {
        let base = Url::parse(&self.receiver.base_url).map_err(|e| UpstreamError::Protocol {
            detail: format!("invalid receiver base url: {e}"),
        })?;
        let host = base.host_str().ok_or_else(|| UpstreamError::Protocol {
            detail: "receiver base url has no host".to_string(),
        })?;
        let url = format!(
            "http://{}:{}/{}",
            host, self.receiver.stream_port, service_ref
        );
        Url::parse(&url).map_err(|e| UpstreamError::Protocol {
            detail: format!("invalid stream url: {e}"),
        })
    }

    /// Open the upstream byte stream for one service reference.
    ///
    /// Cancelling `ctx` while the connection is being established unwinds
    /// deterministically and returns `UpstreamError::Cancelled`.
    pub async fn open(
        &self,
        ctx: &CancellationToken,
        service_ref: &str,
    ) -> Result<UpstreamConnection, UpstreamError> {
        let url = self.stream_url(service_ref)?;
        let started = Instant::now();

        let mut request = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, &self.upstream.stream_user_agent)
            // Receivers serving Icecast-style streams stall without this
            .header("Icy-MetaData", "1");
        if let Some(ref user) = self.receiver.username {
            request = request.basic_auth(user, self.receiver.password.as_deref());
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(UpstreamError::Cancelled),
            result = request.send() => {
                result.map_err(|e| UpstreamError::from_reqwest(e, started.elapsed()))?
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(UpstreamError::Protocol {
                detail: format!("unexpected upstream status {status}"),
            });
        }

        debug!(url = %url, status = status.as_u16(), "upstream connected");

        Ok(UpstreamConnection {
            stream: Box::pin(response.bytes_stream()),
            idle_timeout: self.upstream.idle_timeout,
            opened_at: started,
        })
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.upstream.backoff_initial, self.upstream.backoff_max)
    }
}

/// One live upstream connection
pub struct UpstreamConnection {
    stream: ByteStream,
    idle_timeout: Duration,
    opened_at: Instant,
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("idle_timeout", &self.idle_timeout)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

impl UpstreamConnection {
    /// Pull the next chunk. `Ok(None)` is a clean upstream EOF. A chunk not
    /// arriving within the idle window tears the connection down with
    /// `UpstreamError::Timeout`.
    pub async fn next_chunk(
        &mut self,
        ctx: &CancellationToken,
    ) -> Result<Option<Bytes>, UpstreamError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(UpstreamError::Cancelled),
            result = tokio::time::timeout(self.idle_timeout, self.stream.next()) => {
                match result {
                    Err(_) => Err(UpstreamError::Timeout {
                        elapsed: self.idle_timeout,
                    }),
                    Ok(None) => Ok(None),
                    Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "upstream read failed");
                        Err(UpstreamError::from_reqwest(e, self.opened_at.elapsed()))
                    }
                }
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// Exponential backoff with jitter, bounded by a configurable maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Next delay: initial * 2^attempt, capped at max, with up to 25% jitter
    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_budget = base.as_millis() as u64 / 4;
        let jitter = if jitter_budget > 0 {
            rand::rng().random_range(0..=jitter_budget)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    /// Reset after a healthy connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReceiverConfig, UpstreamConfig};

    fn fetcher() -> UpstreamFetcher {
        let receiver = ReceiverConfig {
            base_url: "http://receiver.local".to_string(),
            username: None,
            password: None,
            stream_port: 8001,
        };
        UpstreamFetcher::new(UpstreamConfig::default(), receiver).unwrap()
    }

    #[test]
    fn stream_url_uses_stream_port_and_service_ref() {
        let url = fetcher()
            .stream_url("1:0:19:EF75:3F9:1:C00000:0:0:0")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://receiver.local:8001/1:0:19:EF75:3F9:1:C00000:0:0:0"
        );
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(15));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            // 25% jitter on top of the capped base
            assert!(delay <= Duration::from_secs(15) + Duration::from_millis(15000 / 4));
            assert!(delay >= last.min(Duration::from_secs(15)) / 4);
            last = delay;
        }
    }

    #[test]
    fn backoff_reset_restarts_the_ladder() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(15));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn open_returns_cancelled_when_ctx_is_done() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = fetcher()
            .open(&ctx, "1:0:19:EF75:3F9:1:C00000:0:0:0")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Cancelled));
    }
}
