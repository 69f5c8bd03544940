//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! Durable values come from the env file as strings; everything else has a
//! default so a missing file still yields a working proxy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Env file keys owned by [`RuntimeSettings`].
pub mod keys {
    pub const API_BASE_URL: &str = "API_BASE_URL";
    pub const PRESERVE_HOST: &str = "PRESERVE_HOST";
    pub const SYSTEM_PROMPT_REPLACEMENT: &str = "SYSTEM_PROMPT_REPLACEMENT";
    pub const SYSTEM_PROMPT_BLOCK_INSERT_IF_NOT_EXIST: &str = "SYSTEM_PROMPT_BLOCK_INSERT_IF_NOT_EXIST";
    pub const DEBUG_MODE: &str = "DEBUG_MODE";
    pub const PORT: &str = "PORT";
    pub const ENABLE_DASHBOARD: &str = "ENABLE_DASHBOARD";
    pub const DASHBOARD_API_KEY: &str = "DASHBOARD_API_KEY";

    pub const CONNECT_TIMEOUT_SECS: &str = "CONNECT_TIMEOUT_SECS";
    pub const READ_TIMEOUT_SECS: &str = "READ_TIMEOUT_SECS";
    pub const PENDING_TIMEOUT_SECS: &str = "PENDING_TIMEOUT_SECS";
    pub const BACKUP_KEEP_COUNT: &str = "BACKUP_KEEP_COUNT";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const METRICS_ENABLED: &str = "METRICS_ENABLED";
    pub const METRICS_ADDRESS: &str = "METRICS_ADDRESS";
    pub const SUPERVISOR_ENABLED: &str = "SUPERVISOR_ENABLED";
}

pub const DEFAULT_TARGET_BASE_URL: &str = "https://anyrouter.top";

/// Root configuration for the relay.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Values an operator may change at runtime.
    pub settings: RuntimeSettings,

    /// Locations of durable state.
    pub paths: ConfigPaths,

    /// Upstream timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Ring sizes and janitor settings.
    pub telemetry: TelemetryConfig,

    /// Live log stream settings.
    pub log_stream: LogStreamConfig,

    /// Logging and metrics exposition.
    pub observability: ObservabilityConfig,

    /// Target-specific compatibility rules.
    pub compat: CompatConfig,

    /// Deferred restart behaviour.
    pub restart: RestartConfig,

    /// Backups retained by the config store.
    pub backup_keep_count: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            settings: RuntimeSettings::default(),
            paths: ConfigPaths::default(),
            timeouts: TimeoutConfig::default(),
            telemetry: TelemetryConfig::default(),
            log_stream: LogStreamConfig::default(),
            observability: ObservabilityConfig::default(),
            compat: CompatConfig::default(),
            restart: RestartConfig::default(),
            backup_keep_count: 10,
        }
    }
}

impl ProxyConfig {
    /// Build a configuration from merged env values rooted at `env_dir`.
    pub fn from_env(env_dir: impl Into<PathBuf>, env: &BTreeMap<String, String>) -> Self {
        let mut config = Self {
            settings: RuntimeSettings::from_env(env),
            paths: ConfigPaths::new(env_dir),
            ..Self::default()
        };

        if let Some(v) = parse_num(env, keys::CONNECT_TIMEOUT_SECS) {
            config.timeouts.connect_secs = v;
        }
        if let Some(v) = parse_num(env, keys::READ_TIMEOUT_SECS) {
            config.timeouts.read_secs = v;
        }
        if let Some(v) = parse_num(env, keys::PENDING_TIMEOUT_SECS) {
            config.telemetry.pending_timeout_secs = v;
        }
        if let Some(v) = parse_num(env, keys::BACKUP_KEEP_COUNT) {
            config.backup_keep_count = v as usize;
        }
        if let Some(v) = env.get(keys::LOG_FORMAT) {
            config.observability.log_format = v.to_ascii_lowercase();
        }
        if let Some(v) = env.get(keys::METRICS_ENABLED) {
            config.observability.metrics_enabled = parse_bool(v);
        }
        if let Some(v) = env.get(keys::METRICS_ADDRESS) {
            config.observability.metrics_address = v.clone();
        }
        if env.get(keys::SUPERVISOR_ENABLED).map(|v| parse_bool(v)).unwrap_or(false) {
            config.restart.supervised = true;
        }
        config
    }
}

/// Operator-editable settings, persisted in the env file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Default upstream for callers without a mapped credential.
    pub target_base_url: String,

    /// Forward the caller's Host header instead of the target authority.
    pub preserve_host: bool,

    /// Replacement text for the first system prompt block.
    pub system_prompt_replacement: Option<String>,

    /// Insert a new leading block instead of overwriting unrelated prompts.
    pub system_prompt_block_insert_if_not_exist: bool,

    /// Verbose logging.
    pub debug_mode: bool,

    /// Listen port.
    pub port: u16,

    /// Serve the admin API.
    pub dashboard_enabled: bool,

    /// Bearer token for the admin API. Empty disables access.
    pub dashboard_api_key: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            target_base_url: DEFAULT_TARGET_BASE_URL.to_string(),
            preserve_host: false,
            system_prompt_replacement: None,
            system_prompt_block_insert_if_not_exist: false,
            debug_mode: false,
            port: 8088,
            dashboard_enabled: false,
            dashboard_api_key: String::new(),
        }
    }
}

impl RuntimeSettings {
    pub fn from_env(env: &BTreeMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            target_base_url: env
                .get(keys::API_BASE_URL)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or(defaults.target_base_url),
            preserve_host: env.get(keys::PRESERVE_HOST).map(|v| parse_bool(v)).unwrap_or(false),
            system_prompt_replacement: env
                .get(keys::SYSTEM_PROMPT_REPLACEMENT)
                .filter(|v| !v.is_empty())
                .cloned(),
            system_prompt_block_insert_if_not_exist: env
                .get(keys::SYSTEM_PROMPT_BLOCK_INSERT_IF_NOT_EXIST)
                .map(|v| parse_bool(v))
                .unwrap_or(false),
            debug_mode: env.get(keys::DEBUG_MODE).map(|v| parse_bool(v)).unwrap_or(false),
            port: env
                .get(keys::PORT)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            dashboard_enabled: env
                .get(keys::ENABLE_DASHBOARD)
                .map(|v| parse_bool(v))
                .unwrap_or(false),
            dashboard_api_key: env.get(keys::DASHBOARD_API_KEY).cloned().unwrap_or_default(),
        }
    }
}

/// Locations of the durable files, all under one env directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub env_dir: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new("env")
    }
}

impl ConfigPaths {
    pub fn new(env_dir: impl Into<PathBuf>) -> Self {
        Self {
            env_dir: env_dir.into(),
        }
    }

    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    pub fn env_file(&self) -> PathBuf {
        self.env_dir.join(".env")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.env_dir.join("backups")
    }

    pub fn headers_file(&self) -> PathBuf {
        self.env_dir.join(".env.headers.json")
    }

    pub fn mappings_file(&self) -> PathBuf {
        self.env_dir.join(".env.key-mappings.json")
    }
}

/// Timeout configuration for upstream attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Per-read idle timeout in seconds. There is no overall deadline.
    pub read_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            read_secs: 60,
        }
    }
}

/// Telemetry ring sizes and janitor cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub recent_capacity: usize,
    pub error_capacity: usize,
    pub series_capacity: usize,
    /// Diagnostic snapshot cap for error responses, in bytes.
    pub snapshot_cap_bytes: usize,
    pub tick_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// Pending entries older than this are failed by the janitor.
    pub pending_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 1000,
            error_capacity: 500,
            series_capacity: 1440,
            snapshot_cap_bytes: 50 * 1024,
            tick_interval_secs: 60,
            sweep_interval_secs: 60,
            pending_timeout_secs: 600,
        }
    }
}

/// Live log stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStreamConfig {
    pub backlog_capacity: usize,
    pub subscriber_capacity: usize,
    /// Backlog entries replayed to a new subscriber.
    pub replay_count: usize,
    pub heartbeat_secs: u64,
    pub status_interval_secs: u64,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 1000,
            subscriber_capacity: 100,
            replay_count: 20,
            heartbeat_secs: 30,
            status_interval_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `json` or `pretty`.
    pub log_format: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Compatibility rules for targets with special requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatConfig {
    /// Path whose body is subject to system prompt rewriting.
    pub chat_path: String,

    /// Case-insensitive marker that makes insert mode replace instead.
    pub keyword: String,

    /// Substring of a target URL that identifies the forced provider.
    pub forced_target_marker: String,

    /// Canonical prompt the forced provider requires.
    pub forced_system_prompt: String,

    /// Comma-separated capability header the forced provider inspects.
    pub capability_header: String,

    /// Token that must appear exactly once in the capability header.
    pub capability_token: String,

    /// Tokens appended when the capability header is absent.
    pub capability_default_tail: String,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            chat_path: "/v1/messages".to_string(),
            keyword: "Claude Code".to_string(),
            forced_target_marker: "anyrouter.top".to_string(),
            forced_system_prompt: "You are Claude Code, Anthropic's official CLI for Claude.".to_string(),
            capability_header: "anthropic-beta".to_string(),
            capability_token: "claude-code-20250219".to_string(),
            capability_default_tail: "interleaved-thinking-2025-05-14".to_string(),
        }
    }
}

/// How a scheduled restart is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartStrategy {
    /// Signal when supervised, exec otherwise.
    Auto,
    /// Re-exec the current binary.
    Exec,
    /// Shut down gracefully and let a supervisor restart us.
    Signal,
}

/// Deferred restart configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    pub strategy: RestartStrategy,
    pub delay_ms: u64,
    pub supervised: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            strategy: RestartStrategy::Auto,
            delay_ms: 1000,
            supervised: false,
        }
    }
}

/// Truthy strings: `true`, `1`, `yes` (case-insensitive).
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Render a bool the way the env file stores it.
pub fn bool_to_env(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn parse_num(env: &BTreeMap<String, String>, key: &str) -> Option<u64> {
    env.get(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = RuntimeSettings::from_env(&BTreeMap::new());
        assert_eq!(settings, RuntimeSettings::default());
        assert_eq!(settings.port, 8088);
        assert!(settings.system_prompt_replacement.is_none());
    }

    #[test]
    fn test_settings_from_env() {
        let settings = RuntimeSettings::from_env(&env(&[
            ("API_BASE_URL", "https://api.example.com"),
            ("PRESERVE_HOST", "YES"),
            ("SYSTEM_PROMPT_REPLACEMENT", "be brief"),
            ("SYSTEM_PROMPT_BLOCK_INSERT_IF_NOT_EXIST", "1"),
            ("PORT", "not-a-port"),
            ("ENABLE_DASHBOARD", "false"),
        ]));
        assert_eq!(settings.target_base_url, "https://api.example.com");
        assert!(settings.preserve_host);
        assert_eq!(settings.system_prompt_replacement.as_deref(), Some("be brief"));
        assert!(settings.system_prompt_block_insert_if_not_exist);
        assert_eq!(settings.port, 8088);
        assert!(!settings.dashboard_enabled);
    }

    #[test]
    fn test_proxy_config_tunables() {
        let config = ProxyConfig::from_env(
            "/tmp/relay",
            &env(&[
                ("READ_TIMEOUT_SECS", "5"),
                ("BACKUP_KEEP_COUNT", "3"),
                ("LOG_FORMAT", "JSON"),
                ("SUPERVISOR_ENABLED", "true"),
            ]),
        );
        assert_eq!(config.timeouts.read_secs, 5);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.backup_keep_count, 3);
        assert_eq!(config.observability.log_format, "json");
        assert!(config.restart.supervised);
        assert_eq!(config.paths.mappings_file(), PathBuf::from("/tmp/relay/.env.key-mappings.json"));
    }
}
