//! OpenWebIF receiver client
//!
//! Talks to the receiver's HTTP API for bouquets, services, and now/next
//! EPG. The artifact writers in this module render the results into the
//! M3U channel list and XMLTV guide served from the static surface.

use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub mod m3u;
pub mod refresh;
pub mod xmltv;

pub use refresh::ArtifactRefresher;

use crate::config::ReceiverConfig;
use crate::errors::{AppError, UpstreamError};

#[derive(Debug, Clone, Deserialize)]
pub struct BouquetsResponse {
    pub bouquets: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesResponse {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    #[serde(rename = "servicereference")]
    pub service_ref: String,
    #[serde(rename = "servicename")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpgResponse {
    #[serde(default)]
    pub events: Vec<EpgEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpgEvent {
    #[serde(rename = "sref")]
    pub service_ref: String,
    pub title: String,
    #[serde(rename = "begin_timestamp")]
    pub begin: i64,
    #[serde(rename = "duration_sec")]
    pub duration: i64,
    #[serde(default, rename = "shortdesc")]
    pub short_desc: Option<String>,
}

#[derive(Clone)]
pub struct OpenWebIfClient {
    client: reqwest::Client,
    config: ReceiverConfig,
}

impl OpenWebIfClient {
    pub fn new(config: ReceiverConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::internal(format!("failed to build receiver client: {e}")))?;
        Ok(OpenWebIfClient { client, config })
    }

    pub fn stream_host(&self) -> Result<String, UpstreamError> {
        let base = Url::parse(&self.config.base_url).map_err(|e| UpstreamError::Protocol {
            detail: format!("invalid receiver base url: {e}"),
        })?;
        base.host_str()
            .map(str::to_string)
            .ok_or_else(|| UpstreamError::Protocol {
                detail: "receiver base url has no host".to_string(),
            })
    }

    pub fn stream_port(&self) -> u16 {
        self.config.stream_port
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self.client.get(&url).query(query);
        if let Some(ref user) = self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let started = std::time::Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(e, started.elapsed()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(UpstreamError::Protocol {
                detail: format!("receiver answered {status} for {path}"),
            });
        }
        response.json().await.map_err(|e| UpstreamError::Protocol {
            detail: format!("invalid receiver response for {path}: {e}"),
        })
    }

    pub async fn bouquets(&self) -> Result<Vec<(String, String)>, UpstreamError> {
        let response: BouquetsResponse = self.get_json("/api/bouquets", &[]).await?;
        debug!(count = response.bouquets.len(), "fetched bouquets");
        Ok(response.bouquets)
    }

    pub async fn services(&self, bouquet_ref: &str) -> Result<Vec<Service>, UpstreamError> {
        let response: ServicesResponse = self
            .get_json("/api/getservices", &[("sRef", bouquet_ref)])
            .await?;
        debug!(count = response.services.len(), "fetched services");
        Ok(response.services)
    }

    pub async fn epg_now_next(&self, bouquet_ref: &str) -> Result<Vec<EpgEvent>, UpstreamError> {
        let response: EpgResponse = self
            .get_json("/api/epgnownext", &[("bRef", bouquet_ref)])
            .await?;
        debug!(count = response.events.len(), "fetched epg events");
        Ok(response.events)
    }
}
