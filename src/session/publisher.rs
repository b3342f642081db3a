//! HLS playlist publisher
//!
//! Background task bound to a single session directory. Polls the
//! writer-owned `index.m3u8.tmp`; once it holds a complete playlist whose
//! referenced segments exist on disk, it is promoted to `index.m3u8` with an
//! atomic rename. The publisher is the only writer of `index.m3u8`; the tmp
//! file is never deleted here, the transcoder recreates it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics::Metrics;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct PlaylistPublisher {
    session_dir: PathBuf,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
}

impl PlaylistPublisher {
    pub fn new(session_dir: PathBuf, metrics: Arc<Metrics>) -> Self {
        PlaylistPublisher {
            session_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until the session context is cancelled. `ready` fires on the
    /// first successful promotion; later promotions just refresh the
    /// published playlist.
    pub async fn run(self, ctx: CancellationToken, ready: oneshot::Sender<()>) {
        let tmp = self.session_dir.join("index.m3u8.tmp");
        let target = self.session_dir.join("index.m3u8");
        let mut ready = Some(ready);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.try_promote(&tmp, &target).await {
                Ok(true) => {
                    self.metrics
                        .playlist_promotions
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if let Some(tx) = ready.take() {
                        debug!(dir = %self.session_dir.display(), "first playlist promotion");
                        let _ = tx.send(());
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(dir = %self.session_dir.display(), error = %e, "playlist promotion failed");
                }
            }
        }
        debug!(dir = %self.session_dir.display(), "publisher stopped");
    }

    /// Promote once if the tmp playlist is complete. Returns whether a
    /// rename happened.
    async fn try_promote(&self, tmp: &Path, target: &Path) -> std::io::Result<bool> {
        let content = match tokio::fs::read_to_string(tmp).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        if !playlist_complete(&content, &self.session_dir) {
            trace!(dir = %self.session_dir.display(), "tmp playlist not yet valid");
            return Ok(false);
        }

        tokio::fs::rename(tmp, target).await?;
        Ok(true)
    }
}

/// A playlist is promotable when it is non-empty, starts with the HLS magic,
/// and every referenced media file already exists in the session directory.
fn playlist_complete(content: &str, dir: &Path) -> bool {
    if !content.starts_with("#EXTM3U") {
        return false;
    }
    let mut any_line = false;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        any_line = true;
        // segment references are bare file names within the session dir
        if line.contains('/') || !dir.join(line).exists() {
            return false;
        }
    }
    // a header-only playlist is not worth promoting
    any_line || content.contains("#EXT-X-ENDLIST")
}
