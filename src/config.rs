//! Runtime configuration.
//!
//! Loaded from `{config_dir}/tasks.json` when present. Otherwise environment
//! variables are used, with built-in defaults for anything unset.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_OPENCODE_URL: &str = "http://127.0.0.1:4096";

/// Backoff schedule for completion polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff: f64,
    /// Lower bound applied to every wait budget.
    pub min_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            max_interval_ms: 2_000,
            backoff: 1.5,
            min_timeout_ms: 1_000,
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms.max(1))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms).max(1))
    }

    /// Next interval after `current`, capped at the maximum.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff.is_finite() && self.backoff >= 1.0 {
            self.backoff
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max_interval())
    }

    /// Total wait budget for a requested timeout.
    pub fn budget(&self, timeout: Duration) -> Duration {
        timeout.max(Duration::from_millis(self.min_timeout_ms))
    }
}

/// Bounds for the delivered/notified key cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the OpenCode server.
    pub opencode_url: String,
    /// Wait budget for synchronous tasks and `get_task_output` when the
    /// caller gives none.
    pub default_timeout_ms: u64,
    /// Maximum busy child tasks per caller. `None` disables the cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_tasks: Option<usize>,
    pub poll: PollConfig,
    pub broadcast_max_chars: usize,
    pub cache: CacheConfig,
    /// Tell the caller when an async task fails to start.
    pub notify_start_failures: bool,
    /// Tell the parent when an async task goes idle or errors.
    pub notify_completion: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            opencode_url: DEFAULT_OPENCODE_URL.to_string(),
            default_timeout_ms: 300_000,
            max_active_tasks: None,
            poll: PollConfig::default(),
            broadcast_max_chars: 1_000,
            cache: CacheConfig::default(),
            notify_start_failures: false,
            notify_completion: true,
        }
    }
}

impl Config {
    /// Load from `{config_dir}/tasks.json`, falling back to the environment.
    pub fn load(config_dir: Option<&Path>) -> Self {
        let Some(dir) = config_dir else {
            return Self::from_env();
        };
        let path = dir.join("tasks.json");
        if !path.exists() {
            tracing::info!(
                "No config file found at {}, using environment defaults",
                path.display()
            );
            return Self::from_env();
        }

        match Self::load_from_path(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {}: {}, using environment defaults",
                    path.display(),
                    e
                );
                Self::from_env()
            }
        }
    }

    fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build from environment variables:
    /// - `OPENCODE_URL` - OpenCode server base URL
    /// - `TASK_DEFAULT_TIMEOUT_MS` - default wait budget
    /// - `TASK_MAX_ACTIVE` - busy child task cap per caller
    /// - `TASK_POLL_INITIAL_MS`, `TASK_POLL_MAX_MS`, `TASK_POLL_BACKOFF` - polling schedule
    /// - `BROADCAST_MAX_CHARS` - broadcast body cap
    /// - `TASK_CACHE_CAPACITY`, `TASK_CACHE_TTL_SECS` - delivery cache bounds
    /// - `TASK_NOTIFY_START_FAILURES`, `TASK_NOTIFY_COMPLETION` - notices
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let opencode_url = std::env::var("OPENCODE_URL")
            .ok()
            .filter(|u| url::Url::parse(u).is_ok())
            .unwrap_or(defaults.opencode_url);

        Self {
            opencode_url,
            default_timeout_ms: env_parse("TASK_DEFAULT_TIMEOUT_MS")
                .unwrap_or(defaults.default_timeout_ms),
            max_active_tasks: env_parse("TASK_MAX_ACTIVE").filter(|n: &usize| *n > 0),
            poll: PollConfig {
                initial_interval_ms: env_parse("TASK_POLL_INITIAL_MS")
                    .unwrap_or(defaults.poll.initial_interval_ms),
                max_interval_ms: env_parse("TASK_POLL_MAX_MS")
                    .unwrap_or(defaults.poll.max_interval_ms),
                backoff: env_parse("TASK_POLL_BACKOFF").unwrap_or(defaults.poll.backoff),
                min_timeout_ms: defaults.poll.min_timeout_ms,
            },
            broadcast_max_chars: env_parse("BROADCAST_MAX_CHARS")
                .unwrap_or(defaults.broadcast_max_chars),
            cache: CacheConfig {
                capacity: env_parse("TASK_CACHE_CAPACITY").unwrap_or(defaults.cache.capacity),
                ttl_secs: env_parse("TASK_CACHE_TTL_SECS").unwrap_or(defaults.cache.ttl_secs),
            },
            notify_start_failures: env_bool("TASK_NOTIFY_START_FAILURES")
                .unwrap_or(defaults.notify_start_failures),
            notify_completion: env_bool("TASK_NOTIFY_COMPLETION")
                .unwrap_or(defaults.notify_completion),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.opencode_url)
            .map_err(|e| anyhow::anyhow!("Invalid opencode_url {}: {}", self.opencode_url, e))?;
        if self.broadcast_max_chars == 0 {
            anyhow::bail!("broadcast_max_chars must be positive");
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
