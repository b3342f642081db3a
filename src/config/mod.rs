//! Configuration loading and validation
//!
//! Configuration is layered: built-in defaults, then a YAML file with an
//! explicit `configVersion`, then environment variable overrides. In strict
//! mode (the default) unknown keys in the file are rejected.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{AppError, StoreError};
use crate::models::ProfileSpec;
use defaults::*;

/// Schema version this binary understands
pub const CONFIG_VERSION: u32 = 1;

/// Environment variables honored as overrides, with their config paths
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATA_DIR", "storage.data_dir"),
    ("HLS_ROOT", "storage.hls_root"),
    ("STORAGE_BACKEND", "storage.backend"),
    ("LISTEN_ADDR", "web.listen_addr"),
    ("TLS_CERT", "web.tls_cert"),
    ("TLS_KEY", "web.tls_key"),
    ("RECEIVER_BASE_URL", "receiver.base_url"),
    ("RECEIVER_USER", "receiver.username"),
    ("RECEIVER_PASS", "receiver.password"),
    ("RECEIVER_STREAM_PORT", "receiver.stream_port"),
    ("SESSION_MAX_LIFETIME", "sessions.max_lifetime"),
    ("DVR_WINDOW_SEC", "sessions.dvr_window_sec"),
    ("DEATH_LINE_DISK_PCT", "death_lines.disk_pct"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "configVersion")]
    pub config_version: u32,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub receiver: ReceiverConfig,
    pub upstream: UpstreamConfig,
    pub runner: RunnerConfig,
    pub sessions: SessionsConfig,
    pub death_lines: DeathLinesConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub auth: AuthConfig,
    pub webui: WebUiConfig,
    pub epg: EpgConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            config_version: CONFIG_VERSION,
            web: WebConfig::default(),
            storage: StorageConfig::default(),
            receiver: ReceiverConfig::default(),
            upstream: UpstreamConfig::default(),
            runner: RunnerConfig::default(),
            sessions: SessionsConfig::default(),
            death_lines: DeathLinesConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            auth: AuthConfig::default(),
            webui: WebUiConfig::default(),
            epg: EpgConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub listen_addr: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for WebConfig {
    fn default() -> Self {
        WebConfig {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            tls_cert: None,
            tls_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `sqlite` or `memory`; anything else is rejected at load
    pub backend: String,
    pub data_dir: PathBuf,
    pub hls_root: PathBuf,
    pub sqlite: SqliteConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: DEFAULT_STORAGE_BACKEND.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            hls_root: PathBuf::from(DEFAULT_HLS_ROOT),
            sqlite: SqliteConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("xg2g.sqlite")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    #[serde(with = "duration_serde")]
    pub busy_timeout: Duration,
    pub journal_mode: String,
    pub synchronous: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            busy_timeout: Duration::from_secs(5),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// OpenWebIF base URL, e.g. `http://vuduo.local`
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Enigma2 stream relay port
    pub stream_port: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            base_url: String::new(),
            username: None,
            password: None,
            stream_port: DEFAULT_STREAM_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// A chunk must arrive within this window or the connection is torn down
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub backoff_initial: Duration,
    #[serde(with = "duration_serde")]
    pub backoff_max: Duration,
    /// Known-good user agent for quirky receiver firmware
    pub stream_user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(15),
            stream_user_agent: DEFAULT_STREAM_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub ffmpeg_command: String,
    /// Stderr lines retained for post-mortem reporting
    pub log_ring_lines: usize,
    /// Soft terminate grace before escalating to kill
    #[serde(with = "duration_serde")]
    pub stop_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            ffmpeg_command: DEFAULT_FFMPEG_COMMAND.to_string(),
            log_ring_lines: DEFAULT_LOG_RING_LINES,
            stop_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Latency death line: no session outlives this
    #[serde(with = "duration_serde")]
    pub max_lifetime: Duration,
    /// How long a stopped session's registry entry and directory linger
    #[serde(with = "duration_serde")]
    pub grace: Duration,
    /// A worker not exiting within this after cancellation is a zombie
    #[serde(with = "duration_serde")]
    pub cleanup_deadline: Duration,
    #[serde(with = "duration_serde")]
    pub idempotency_ttl: Duration,
    /// Default DVR window applied to profiles that do not set one
    pub dvr_window_sec: u32,
    pub profiles: Vec<ProfileSpec>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        SessionsConfig {
            max_lifetime: Duration::from_secs(4 * 3600),
            grace: Duration::from_secs(30),
            cleanup_deadline: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(30),
            dvr_window_sec: 0,
            profiles: vec![ProfileSpec::builtin_live()],
        }
    }
}

impl SessionsConfig {
    pub fn profile(&self, name: &str) -> Option<&ProfileSpec> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeathLinesConfig {
    /// Disk usage of the HLS root filesystem, percent
    pub disk_pct: u8,
    /// Process tree RSS watermark in MiB; 0 disables the check
    pub rss_mb: u64,
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for DeathLinesConfig {
    fn default() -> Self {
        DeathLinesConfig {
            disk_pct: DEFAULT_DISK_PCT,
            rss_mb: 0,
            check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    /// Any of `read`, `write`, `admin`
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebUiConfig {
    /// Externally built asset tree; absent disables the UI routes
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub refresh_interval: Duration,
}

impl Default for EpgConfig {
    fn default() -> Self {
        EpgConfig {
            enabled: true,
            refresh_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the YAML file (if present), then
    /// environment overrides. `strict` rejects unknown file keys.
    pub fn load(path: &Path, strict: bool) -> Result<Self, AppError> {
        let file_exists = path.exists();

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if file_exists {
            figment = figment.merge(Yaml::file(path));
        }
        for (env, key) in ENV_OVERRIDES {
            let target = *key;
            figment = figment.merge(
                Env::raw()
                    .only(&[*env])
                    .map(move |_| target.into())
                    .split("."),
            );
        }

        let config: Config = figment
            .extract()
            .map_err(|e| AppError::configuration(format!("failed to load config: {e}")))?;

        if file_exists {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                AppError::configuration(format!("failed to read {}: {e}", path.display()))
            })?;
            let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
                AppError::configuration(format!("invalid YAML in {}: {e}", path.display()))
            })?;
            check_config_version(&value)?;
            if strict {
                check_unknown_keys(&value, &config)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.config_version != CONFIG_VERSION {
            return Err(AppError::configuration(format!(
                "unsupported configVersion {} (expected {CONFIG_VERSION})",
                self.config_version
            )));
        }

        match self.storage.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(AppError::Store(StoreError::UnsupportedBackend(
                    other.to_string(),
                )));
            }
        }

        self.web
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                AppError::configuration(format!(
                    "invalid listen_addr {:?}: {e}",
                    self.web.listen_addr
                ))
            })?;

        match (&self.web.tls_cert, &self.web.tls_key) {
            (None, None) => {}
            (Some(cert), Some(key)) => {
                for p in [cert, key] {
                    if !p.exists() {
                        return Err(AppError::configuration(format!(
                            "TLS file does not exist: {}",
                            p.display()
                        )));
                    }
                }
            }
            _ => {
                return Err(AppError::configuration(
                    "TLS requires both tls_cert and tls_key",
                ));
            }
        }

        if self.receiver.base_url.is_empty() {
            return Err(AppError::configuration("receiver.base_url is required"));
        }
        url::Url::parse(&self.receiver.base_url).map_err(|e| {
            AppError::configuration(format!(
                "invalid receiver.base_url {:?}: {e}",
                self.receiver.base_url
            ))
        })?;

        if !(1..=100).contains(&self.death_lines.disk_pct) {
            return Err(AppError::configuration(
                "death_lines.disk_pct must be 1-100",
            ));
        }

        if self.storage.sqlite.busy_timeout < Duration::from_secs(5) {
            return Err(AppError::configuration(
                "storage.sqlite.busy_timeout must be at least 5s",
            ));
        }

        let mut names = HashSet::new();
        for profile in &self.sessions.profiles {
            profile.validate()?;
            if !names.insert(profile.name.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate profile name {:?}",
                    profile.name
                )));
            }
        }

        for token in &self.auth.tokens {
            if token.token.len() < 16 {
                return Err(AppError::configuration(
                    "auth tokens must be at least 16 characters",
                ));
            }
            for scope in &token.scopes {
                if !matches!(scope.as_str(), "read" | "write" | "admin") {
                    return Err(AppError::configuration(format!(
                        "unknown auth scope {scope:?}"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_config_version(value: &serde_yaml::Value) -> Result<(), AppError> {
    let key = serde_yaml::Value::String("configVersion".to_string());
    let version = value.as_mapping().and_then(|m| m.get(&key));
    match version {
        Some(v) if v.as_u64() == Some(CONFIG_VERSION as u64) => Ok(()),
        Some(v) => Err(AppError::configuration(format!(
            "unsupported configVersion {v:?} (expected {CONFIG_VERSION})"
        ))),
        None => Err(AppError::configuration(
            "config file must declare configVersion",
        )),
    }
}

/// Strict-mode check: every key path in the file must exist in the loaded
/// config shape. Sequences are compared element-wise where lengths match.
fn check_unknown_keys(file: &serde_yaml::Value, config: &Config) -> Result<(), AppError> {
    let known = serde_json::to_value(config)
        .map_err(|e| AppError::internal(format!("config reserialization failed: {e}")))?;
    let mut unknown = Vec::new();
    walk_keys(file, &known, String::new(), &mut unknown);
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(AppError::configuration(format!(
            "unknown config keys: {}",
            unknown.join(", ")
        )))
    }
}

fn walk_keys(
    file: &serde_yaml::Value,
    known: &serde_json::Value,
    prefix: String,
    unknown: &mut Vec<String>,
) {
    match file {
        serde_yaml::Value::Mapping(map) => {
            for (key, child) in map {
                let Some(key) = key.as_str() else { continue };
                let path = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}.{key}")
                };
                match known.get(key) {
                    Some(known_child) => walk_keys(child, known_child, path, unknown),
                    None => unknown.push(path),
                }
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            if let Some(known_seq) = known.as_array() {
                for (i, child) in seq.iter().enumerate() {
                    if let Some(known_child) = known_seq.get(i) {
                        walk_keys(child, known_child, format!("{prefix}[{i}]"), unknown);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = r#"
configVersion: 1
receiver:
  base_url: "http://receiver.local"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL);
        let config = Config::load(&path, true).unwrap();
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.receiver.stream_port, 8001);
        assert_eq!(config.sessions.profiles.len(), 1);
    }

    #[test]
    fn missing_config_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "receiver:\n  base_url: \"http://r.local\"\n");
        assert!(Config::load(&path, true).is_err());
    }

    #[test]
    fn unknown_keys_rejected_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "configVersion: 1\nreceiver:\n  base_url: \"http://r.local\"\n  bouqet: tv\n",
        );
        let err = Config::load(&path, true).unwrap_err();
        assert!(err.to_string().contains("receiver.bouqet"), "{err}");
        assert!(Config::load(&path, false).is_ok());
    }

    #[test]
    fn unsupported_backend_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "configVersion: 1\nstorage:\n  backend: badger\nreceiver:\n  base_url: \"http://r.local\"\n",
        );
        let err = Config::load(&path, true).unwrap_err();
        assert!(err.to_string().contains("badger"));
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL);
        figment::Jail::expect_with(|jail| {
            jail.set_env("STORAGE_BACKEND", "memory");
            jail.set_env("DEATH_LINE_DISK_PCT", "75");
            let config = Config::load(&path, true).expect("load");
            assert_eq!(config.storage.backend, "memory");
            assert_eq!(config.death_lines.disk_pct, 75);
            Ok(())
        });
    }

    #[test]
    fn tls_must_be_paired() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "configVersion: 1\nweb:\n  tls_cert: /tmp/cert.pem\nreceiver:\n  base_url: \"http://r.local\"\n",
        );
        assert!(Config::load(&path, true).is_err());
    }
}
