//! Periodic artifact refresh
//!
//! Renders `playlist.m3u`, `xmltv.xml`, and `epg.xml` into the data
//! directory on an interval. Artifacts are written to a temp file and
//! renamed so the static surface never serves a partial file.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{OpenWebIfClient, m3u, xmltv};
use crate::errors::AppError;

pub struct ArtifactRefresher {
    client: OpenWebIfClient,
    data_dir: PathBuf,
    interval: Duration,
}

impl ArtifactRefresher {
    pub fn new(client: OpenWebIfClient, data_dir: PathBuf, interval: Duration) -> Self {
        ArtifactRefresher {
            client,
            data_dir,
            interval,
        }
    }

    pub async fn run(self, root_ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = root_ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.refresh_once().await {
                warn!(error = %e, "artifact refresh failed");
            }
        }
    }

    pub async fn refresh_once(&self) -> Result<(), AppError> {
        let bouquets = self.client.bouquets().await?;
        let Some((bouquet_ref, bouquet_name)) = bouquets.first() else {
            warn!("receiver reports no bouquets");
            return Ok(());
        };

        let services = self.client.services(bouquet_ref).await?;
        let events = self.client.epg_now_next(bouquet_ref).await.unwrap_or_else(|e| {
            warn!(error = %e, "epg fetch failed, writing guide without programmes");
            Vec::new()
        });

        let host = self.client.stream_host()?;
        let playlist = m3u::render(&services, &host, self.client.stream_port());
        let guide = xmltv::render(&services, &events)?;

        write_atomic(&self.data_dir.join("playlist.m3u"), playlist.as_bytes()).await?;
        write_atomic(&self.data_dir.join("xmltv.xml"), guide.as_bytes()).await?;
        write_atomic(&self.data_dir.join("epg.xml"), guide.as_bytes()).await?;

        info!(
            bouquet = %bouquet_name,
            services = services.len(),
            programmes = events.len(),
            "artifacts refreshed"
        );
        Ok(())
    }
}

async fn write_atomic(target: &Path, contents: &[u8]) -> Result<(), AppError> {
    let tmp = target.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|source| crate::errors::FsError::Io {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, target)
        .await
        .map_err(|source| crate::errors::FsError::Io {
            path: target.to_path_buf(),
            source,
        })?;
    Ok(())
}
