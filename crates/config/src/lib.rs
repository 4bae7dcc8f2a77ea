// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Manager configuration, read from the process environment with an optional
//! `.env` file on top. A process-wide instance is reachable through
//! [`settings()`]; `reload()` re-reads everything and swaps the live instance
//! in place so long-running tasks pick up the new values on their next call.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

/// Env keys owned by this module. Cleared before a reload so deletions in
/// `.env` actually take effect (dotenv never overrides existing vars).
const CONFIG_ENV_KEYS: &[&str] = &[
    "MANAGER_PROTOCOL",
    "MANAGER_HOST",
    "MANAGER_PORT",
    "ENVIRONMENT",
    "CLEANUP_TASK_FILES_DAYS",
    "CLEANUP_INTERVAL_SECONDS",
    "RUNNER_POLL_INTERVAL_SECONDS",
    "RUNNER_STALENESS_SECONDS",
    "LOG_DIRECTORY",
    "LOG_LEVEL",
    "LOG_FILE",
    "RUNNERS_STORAGE_ENABLED",
    "RUNNERS_STORAGE_PATH",
    "PRIORITIES_ENABLED",
    "PRIORITY_DOMAIN",
    "MAX_OTHER_DOMAIN_TASK_PERCENT",
    "COMPLETION_NOTIFY_MAX_RETRIES",
    "COMPLETION_NOTIFY_RETRY_DELAY_SECONDS",
    "COMPLETION_NOTIFY_BACKOFF_FACTOR",
    "CORS_ALLOW_ORIGINS",
    "CORS_ALLOW_CREDENTIALS",
    "CORS_ALLOW_METHODS",
    "CORS_ALLOW_HEADERS",
    "NOTIFY_URL_ALLOWED_HOSTS",
    "NOTIFY_URL_ALLOW_PRIVATE_NETWORKS",
    "RATE_LIMIT_PER_MINUTE",
];

const CONFIG_ENV_PREFIXES: &[&str] = &["AUTHORIZED_TOKENS__", "ADMIN_USERS__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    fn from_env_str(v: &str) -> Self {
        match v.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum LoggingLevel {
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
    OFF,
}

impl LoggingLevel {
    fn from_env_str(v: &str) -> Self {
        match v.trim().to_ascii_uppercase().as_str() {
            "ERROR" | "CRITICAL" => Self::ERROR,
            "WARN" | "WARNING" => Self::WARN,
            "DEBUG" => Self::DEBUG,
            "TRACE" => Self::TRACE,
            "OFF" => Self::OFF,
            _ => Self::INFO,
        }
    }
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::ERROR => LevelFilter::ERROR,
            LoggingLevel::WARN => LevelFilter::WARN,
            LoggingLevel::INFO => LevelFilter::INFO,
            LoggingLevel::DEBUG => LevelFilter::DEBUG,
            LoggingLevel::TRACE => LevelFilter::TRACE,
            LoggingLevel::OFF => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid CORS configuration: CORS_ALLOW_CREDENTIALS=true is not compatible with CORS_ALLOW_ORIGINS=*")]
    CorsCredentialsWithWildcard,

    #[error("RUNNERS_STORAGE_PATH must be set when RUNNERS_STORAGE_ENABLED=true")]
    MissingStoragePath,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub manager_protocol: String,
    pub manager_host: String,
    pub manager_port: u16,
    /// Convenience base URL assembled from protocol/host/port.
    pub manager_url: String,

    /// `AUTHORIZED_TOKENS__<name>=<value>` pairs; any of the values grants
    /// API access.
    pub authorized_tokens: HashMap<String, String>,
    /// `ADMIN_USERS__<name>=<bcrypt hash>` pairs for the admin surface.
    pub admin_users: HashMap<String, String>,

    pub environment: Environment,

    pub cleanup_task_files_days: u64,
    pub cleanup_interval_seconds: u64,
    pub runner_poll_interval_seconds: u64,
    pub runner_staleness_seconds: u64,

    pub log_directory: String,
    pub log_level: LoggingLevel,
    pub log_file: Option<String>,

    pub runners_storage_enabled: bool,
    pub runners_storage_path: PathBuf,

    pub priorities_enabled: bool,
    pub priority_domain: String,
    pub max_other_domain_task_percent: u32,

    pub completion_notify_max_retries: u32,
    pub completion_notify_retry_delay_seconds: u64,
    pub completion_notify_backoff_factor: f64,

    pub cors_allow_origins: Vec<String>,
    pub cors_allow_credentials: bool,
    pub cors_allow_methods: Vec<String>,
    pub cors_allow_headers: Vec<String>,

    pub notify_url_allowed_hosts: Vec<String>,
    pub notify_url_allow_private_networks: bool,

    pub rate_limit_per_minute: u32,
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    let Some(v) = value else { return default };
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        _ => default,
    }
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32_clamped(value: Option<String>, default: u32, min: u32, max: u32) -> u32 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(min as i64, max as i64) as u32)
        .unwrap_or(default)
}

fn parse_f64_min(value: Option<String>, default: f64, min: f64) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|v| v.max(min))
        .unwrap_or(default)
}

fn parse_csv(value: Option<String>, default: &str) -> Vec<String> {
    let raw = value.unwrap_or_else(|| default.to_string());
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        vec![default.to_string()]
    } else {
        items
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn collect_prefixed(prefix: &str) -> HashMap<String, String> {
    std::env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}

impl ManagerConfig {
    /// Build a config from whatever is in the process environment right now.
    pub fn from_env() -> Self {
        let manager_protocol = env_var("MANAGER_PROTOCOL").unwrap_or_else(|| "http".to_string());
        let manager_host = env_var("MANAGER_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let manager_port = env_var("MANAGER_PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(8000);
        let manager_url = format!("{manager_protocol}://{manager_host}:{manager_port}");

        let mut log_directory =
            env_var("LOG_DIRECTORY").unwrap_or_else(|| "/var/log/flow_runner".to_string());
        if !log_directory.ends_with('/') {
            log_directory.push('/');
        }

        let mut cfg = Self {
            manager_protocol,
            manager_host,
            manager_port,
            manager_url,

            authorized_tokens: collect_prefixed("AUTHORIZED_TOKENS__"),
            admin_users: collect_prefixed("ADMIN_USERS__"),

            environment: Environment::from_env_str(
                &env_var("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            ),

            cleanup_task_files_days: parse_u64(env_var("CLEANUP_TASK_FILES_DAYS"), 30),
            cleanup_interval_seconds: parse_u64(env_var("CLEANUP_INTERVAL_SECONDS"), 3600),
            runner_poll_interval_seconds: parse_u64(env_var("RUNNER_POLL_INTERVAL_SECONDS"), 30),
            runner_staleness_seconds: parse_u64(env_var("RUNNER_STALENESS_SECONDS"), 60),

            log_directory,
            log_level: LoggingLevel::from_env_str(
                &env_var("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
            ),
            log_file: env_var("LOG_FILE"),

            runners_storage_enabled: parse_bool(env_var("RUNNERS_STORAGE_ENABLED"), false),
            runners_storage_path: PathBuf::from(
                env_var("RUNNERS_STORAGE_PATH").unwrap_or_else(|| "/tmp/esup-runner".to_string()),
            ),

            priorities_enabled: parse_bool(env_var("PRIORITIES_ENABLED"), false),
            priority_domain: env_var("PRIORITY_DOMAIN")
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase(),
            max_other_domain_task_percent: parse_u32_clamped(
                env_var("MAX_OTHER_DOMAIN_TASK_PERCENT"),
                100,
                0,
                100,
            ),

            completion_notify_max_retries: parse_u32_clamped(
                env_var("COMPLETION_NOTIFY_MAX_RETRIES"),
                5,
                0,
                u32::MAX,
            ),
            completion_notify_retry_delay_seconds: parse_u64(
                env_var("COMPLETION_NOTIFY_RETRY_DELAY_SECONDS"),
                60,
            ),
            completion_notify_backoff_factor: parse_f64_min(
                env_var("COMPLETION_NOTIFY_BACKOFF_FACTOR"),
                1.5,
                1.0,
            ),

            cors_allow_origins: parse_csv(env_var("CORS_ALLOW_ORIGINS"), "*"),
            cors_allow_credentials: parse_bool(env_var("CORS_ALLOW_CREDENTIALS"), false),
            cors_allow_methods: parse_csv(env_var("CORS_ALLOW_METHODS"), "*"),
            cors_allow_headers: parse_csv(env_var("CORS_ALLOW_HEADERS"), "*"),

            notify_url_allowed_hosts: env_var("NOTIFY_URL_ALLOWED_HOSTS")
                .unwrap_or_default()
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            notify_url_allow_private_networks: parse_bool(
                env_var("NOTIFY_URL_ALLOW_PRIVATE_NETWORKS"),
                false,
            ),

            rate_limit_per_minute: parse_u32_clamped(
                env_var("RATE_LIMIT_PER_MINUTE"),
                120,
                1,
                u32::MAX,
            ),
        };

        // Priorities without a domain cannot match anything, treat as disabled.
        if cfg.priorities_enabled && cfg.priority_domain.is_empty() {
            tracing::warn!("PRIORITIES_ENABLED=true but PRIORITY_DOMAIN is empty, disabling priorities");
            cfg.priorities_enabled = false;
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authorized_tokens.is_empty() {
            tracing::warn!("no AUTHORIZED_TOKENS configured, API will be inaccessible");
        }
        if self.admin_users.is_empty() {
            tracing::warn!("no admin users configured, admin interface will be inaccessible");
        }

        if self.cors_allow_credentials && self.cors_allow_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::CorsCredentialsWithWildcard);
        }

        if self.runners_storage_enabled && self.runners_storage_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingStoragePath);
        }

        Ok(())
    }
}

/// Load `.env` into the process environment. An explicit path via
/// `CONFIG_ENV_PATH`/`ENV_FILE` wins over `./.env`.
fn load_environment_variables() {
    let env_path = env_var("CONFIG_ENV_PATH")
        .or_else(|| env_var("ENV_FILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".env"));

    if env_path.exists() {
        match dotenv::from_path(&env_path) {
            Ok(()) => tracing::info!(path = %env_path.display(), "loaded environment variables"),
            Err(e) => tracing::warn!(path = %env_path.display(), "failed to load .env: {e}"),
        }
    } else {
        tracing::info!(path = %env_path.display(), "no .env file found, default configuration used");
    }
}

fn clear_config_env_vars() {
    for (key, _) in std::env::vars() {
        if CONFIG_ENV_KEYS.contains(&key.as_str())
            || CONFIG_ENV_PREFIXES.iter().any(|p| key.starts_with(p))
        {
            std::env::remove_var(&key);
        }
    }
}

static CONFIG: once_cell::sync::Lazy<RwLock<Arc<ManagerConfig>>> =
    once_cell::sync::Lazy::new(|| {
        load_environment_variables();
        RwLock::new(Arc::new(ManagerConfig::from_env()))
    });

/// Current live configuration. Cheap to call; handlers should not cache it
/// across await points longer than one request.
pub fn settings() -> Arc<ManagerConfig> {
    CONFIG.read().clone()
}

/// Re-read the environment plus `.env` and swap the live instance.
/// Registered runners and in-flight tasks are unaffected.
pub fn reload() -> Arc<ManagerConfig> {
    clear_config_env_vars();
    load_environment_variables();
    let fresh = Arc::new(ManagerConfig::from_env());
    *CONFIG.write() = fresh.clone();
    tracing::info!("configuration reloaded");
    fresh
}

/// Replace the live configuration wholesale. Test hook; the server only ever
/// swaps via [`reload`].
pub fn replace_settings(cfg: ManagerConfig) {
    *CONFIG.write() = Arc::new(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> ManagerConfig {
        // Build from a scrubbed environment: parse helpers take explicit
        // Options so we do not have to fight process-global env in tests.
        ManagerConfig {
            manager_protocol: "http".into(),
            manager_host: "0.0.0.0".into(),
            manager_port: 8000,
            manager_url: "http://0.0.0.0:8000".into(),
            authorized_tokens: HashMap::new(),
            admin_users: HashMap::new(),
            environment: Environment::Development,
            cleanup_task_files_days: 30,
            cleanup_interval_seconds: 3600,
            runner_poll_interval_seconds: 30,
            runner_staleness_seconds: 60,
            log_directory: "/var/log/flow_runner/".into(),
            log_level: LoggingLevel::INFO,
            log_file: None,
            runners_storage_enabled: false,
            runners_storage_path: PathBuf::from("/tmp/esup-runner"),
            priorities_enabled: false,
            priority_domain: String::new(),
            max_other_domain_task_percent: 100,
            completion_notify_max_retries: 5,
            completion_notify_retry_delay_seconds: 60,
            completion_notify_backoff_factor: 1.5,
            cors_allow_origins: vec!["*".into()],
            cors_allow_credentials: false,
            cors_allow_methods: vec!["*".into()],
            cors_allow_headers: vec!["*".into()],
            notify_url_allowed_hosts: vec![],
            notify_url_allow_private_networks: false,
            rate_limit_per_minute: 120,
        }
    }

    #[test]
    fn parse_bool_accepts_usual_spellings() {
        for v in ["1", "true", "T", "yes", "Y", "on"] {
            assert!(parse_bool(Some(v.into()), false), "{v}");
        }
        for v in ["0", "false", "F", "no", "N", "off"] {
            assert!(!parse_bool(Some(v.into()), true), "{v}");
        }
        assert!(parse_bool(Some("garbage".into()), true));
        assert!(!parse_bool(None, false));
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(parse_u32_clamped(Some("250".into()), 100, 0, 100), 100);
        assert_eq!(parse_u32_clamped(Some("-3".into()), 100, 0, 100), 0);
        assert_eq!(parse_u32_clamped(Some("42".into()), 100, 0, 100), 42);
        assert_eq!(parse_u32_clamped(Some("junk".into()), 7, 0, 100), 7);
    }

    #[test]
    fn backoff_factor_has_floor() {
        assert_eq!(parse_f64_min(Some("0.5".into()), 1.5, 1.0), 1.0);
        assert_eq!(parse_f64_min(Some("2.0".into()), 1.5, 1.0), 2.0);
        assert_eq!(parse_f64_min(None, 1.5, 1.0), 1.5);
    }

    #[test]
    fn csv_falls_back_to_default_when_empty() {
        assert_eq!(parse_csv(Some("".into()), "*"), vec!["*".to_string()]);
        assert_eq!(
            parse_csv(Some("a, b ,".into()), "*"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn cors_credentials_with_wildcard_is_rejected() {
        let mut cfg = blank();
        cfg.cors_allow_credentials = true;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::CorsCredentialsWithWildcard)
        ));

        cfg.cors_allow_origins = vec!["https://dashboard.example.edu".into()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn environment_parses_loosely() {
        assert!(Environment::from_env_str("Production").is_production());
        assert!(Environment::from_env_str("prod").is_production());
        assert!(!Environment::from_env_str("development").is_production());
        assert!(!Environment::from_env_str("").is_production());
    }

    /// The only test in this crate that touches the process environment; it
    /// uses uniquely named keys so parallel tests cannot collide.
    #[test]
    fn dotenv_file_feeds_from_env_and_reload_clears_removed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(
            &env_file,
            "PRIORITY_DOMAIN=Example.EDU\nAUTHORIZED_TOKENS__SMOKE=smoke-token\n",
        )
        .unwrap();

        std::env::set_var("CONFIG_ENV_PATH", &env_file);
        load_environment_variables();
        let cfg = ManagerConfig::from_env();
        assert_eq!(cfg.priority_domain, "example.edu");
        assert_eq!(
            cfg.authorized_tokens.get("SMOKE").map(String::as_str),
            Some("smoke-token")
        );

        // Dropping a managed key from .env takes effect after a clear +
        // reload, the SIGHUP path.
        std::fs::write(&env_file, "PRIORITY_DOMAIN=other.example\n").unwrap();
        clear_config_env_vars();
        load_environment_variables();
        let cfg = ManagerConfig::from_env();
        assert_eq!(cfg.priority_domain, "other.example");
        assert!(cfg.authorized_tokens.get("SMOKE").is_none());

        std::env::remove_var("CONFIG_ENV_PATH");
        clear_config_env_vars();
    }
}
