//! Death-line watchdog
//!
//! Unconditional termination policies that put node stability above session
//! progress: a per-session maximum lifetime, node resource watermarks (RSS
//! and HLS-root disk usage), and zombie-worker detection after cancellation.

use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use sysinfo::{Disks, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DeathLinesConfig, SessionsConfig};
use crate::metrics::Metrics;
use crate::models::ExitReason;
use crate::session::Session;

use super::Registry;

pub struct DeathLineWatchdog {
    registry: Registry,
    death_lines: DeathLinesConfig,
    sessions: SessionsConfig,
    hls_root: PathBuf,
    metrics: Arc<Metrics>,
}

impl DeathLineWatchdog {
    pub fn new(
        registry: Registry,
        death_lines: DeathLinesConfig,
        sessions: SessionsConfig,
        hls_root: PathBuf,
        metrics: Arc<Metrics>,
    ) -> Self {
        DeathLineWatchdog {
            registry,
            death_lines,
            sessions,
            hls_root,
            metrics,
        }
    }

    pub async fn run(self, root_ctx: CancellationToken) {
        let mut system = System::new();
        let mut flagged_zombies: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(self.death_lines.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = root_ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sessions = self.active_sessions();
            self.enforce_latency(&sessions);
            self.enforce_resources(&sessions, &mut system);
            self.detect_zombies(&sessions, &mut flagged_zombies);
        }
    }

    fn active_sessions(&self) -> Vec<Arc<Session>> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        registry.values().cloned().collect()
    }

    /// Latency death line: no session outlives `max_lifetime`
    fn enforce_latency(&self, sessions: &[Arc<Session>]) {
        let max_lifetime = chrono::Duration::from_std(self.sessions.max_lifetime)
            .unwrap_or_else(|_| chrono::Duration::hours(4));
        let horizon = Utc::now() - max_lifetime;
        for session in sessions {
            if !session.state().is_terminal() && session.created_at < horizon {
                warn!(
                    session_id = %session.id,
                    lifetime = ?self.sessions.max_lifetime,
                    "latency death line: cancelling session"
                );
                session.cancel_with_cause(ExitReason::Deadline);
                self.metrics
                    .sessions_deadline_killed
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Resource death line: shed a session per tick while watermarks are
    /// crossed. No grace, no partial-output rescue.
    fn enforce_resources(&self, sessions: &[Arc<Session>], system: &mut System) {
        let disk_hit = self
            .disk_usage_pct()
            .map(|pct| pct >= self.death_lines.disk_pct as f64)
            .unwrap_or(false);
        let rss_hit = if self.death_lines.rss_mb > 0 {
            process_tree_rss_mb(system) >= self.death_lines.rss_mb
        } else {
            false
        };

        if !disk_hit && !rss_hit {
            return;
        }

        if let Some(victim) = select_victim(sessions) {
            warn!(
                session_id = %victim.id,
                disk_hit,
                rss_hit,
                "resource death line: cancelling session"
            );
            victim.cancel_with_cause(ExitReason::Resource);
            self.metrics
                .sessions_resource_killed
                .fetch_add(1, Ordering::Relaxed);
        } else {
            info!(disk_hit, rss_hit, "resource watermark crossed with no session to shed");
        }
    }

    fn detect_zombies(&self, sessions: &[Arc<Session>], flagged: &mut HashSet<String>) {
        for session in sessions {
            if session.is_zombie(self.sessions.cleanup_deadline) && flagged.insert(session.id.clone())
            {
                error!(
                    session_id = %session.id,
                    deadline = ?self.sessions.cleanup_deadline,
                    "zombie worker: did not exit within cleanup deadline after cancellation"
                );
                self.metrics.zombie_workers.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Usage of the filesystem holding the HLS root, percent
    pub fn disk_usage_pct(&self) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|d| self.hls_root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(disk.available_space());
        Some(used as f64 * 100.0 / total as f64)
    }
}

/// RSS of this process plus direct children (the transcoders), in MiB
fn process_tree_rss_mb(system: &mut System) -> u64 {
    let Ok(me) = sysinfo::get_current_pid() else {
        return 0;
    };
    system.refresh_processes(ProcessesToUpdate::All, true);
    let bytes: u64 = system
        .processes()
        .iter()
        .filter(|(pid, process)| **pid == me || process.parent() == Some(me))
        .map(|(_, process)| process.memory())
        .sum();
    bytes / (1024 * 1024)
}

/// Victims are non-terminal live sessions; VOD jobs are considered critical
/// (finite, partial output is worth keeping). Youngest first.
fn select_victim(sessions: &[Arc<Session>]) -> Option<Arc<Session>> {
    sessions
        .iter()
        .filter(|s| !s.state().is_terminal() && !s.ctx.is_cancelled() && !s.profile.vod)
        .max_by_key(|s| s.created_at)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfileSpec;
    use std::path::PathBuf;

    fn session(id: &str, age_secs: i64, vod: bool) -> Arc<Session> {
        let mut profile = ProfileSpec::builtin_live();
        profile.vod = vod;
        let mut s = Session::new(
            id.to_string(),
            "1:0:19:EF75:3F9:1:C00000:0:0:0".to_string(),
            profile,
            PathBuf::from("/tmp"),
            CancellationToken::new(),
            "ctx".to_string(),
        );
        s.created_at = Utc::now() - chrono::Duration::seconds(age_secs);
        Arc::new(s)
    }

    fn watchdog(max_lifetime_secs: u64) -> DeathLineWatchdog {
        let mut sessions = SessionsConfig::default();
        sessions.max_lifetime = std::time::Duration::from_secs(max_lifetime_secs);
        DeathLineWatchdog::new(
            Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
            DeathLinesConfig::default(),
            sessions,
            PathBuf::from("/tmp"),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn latency_death_line_cancels_overage_sessions() {
        let wd = watchdog(60);
        let young = session("young", 10, false);
        let old = session("old", 120, false);
        wd.enforce_latency(&[young.clone(), old.clone()]);
        assert!(!young.ctx.is_cancelled());
        assert!(old.ctx.is_cancelled());
        assert_eq!(
            wd.metrics.sessions_deadline_killed.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn victim_selection_prefers_youngest_live_session() {
        let older = session("older", 300, false);
        let newer = session("newer", 30, false);
        let vod = session("vod", 5, true);
        let victim = select_victim(&[older.clone(), newer.clone(), vod]).unwrap();
        assert_eq!(victim.id, "newer");

        // already-cancelled sessions are not picked again
        newer.cancel_with_cause(ExitReason::Resource);
        let victim = select_victim(&[older.clone(), newer]).unwrap();
        assert_eq!(victim.id, "older");
    }

    #[test]
    fn vod_only_population_yields_no_victim() {
        let vod = session("vod", 5, true);
        assert!(select_victim(&[vod]).is_none());
    }
}
