//! Session manager configuration.
//!
//! Configuration is read from TOML; a handful of fields can be overridden
//! from `WADDLE_SM_*` environment variables.
//!
//! ```toml
//! component_id = "sess-man@example.com"
//! local_domains = ["example.com"]
//! admins = ["admin@example.com"]
//! auth_timeout_secs = 120
//!
//! [default_concurrency]
//! queues = 8
//! queue_depth = 10000
//!
//! [plugins.roster]
//! concurrency = { queues = 2, queue_depth = 500 }
//! settings = { max-items = 500 }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::XmppError;

/// Default authentication timeout in seconds.
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 120;
/// Default stream-close grace period in seconds.
pub const DEFAULT_CLOSE_GRACE_SECS: u64 = 10;
/// Default timeout for connection liveness checks in seconds.
pub const DEFAULT_CONNECTION_CHECK_TIMEOUT_SECS: u64 = 30;
/// Default worker queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 10_000;

const ENV_PREFIX: &str = "WADDLE_SM_";

/// Queue layout of one worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    /// Number of FIFO queues, each served by one worker
    pub queues: usize,
    /// Capacity of each queue
    pub queue_depth: usize,
}

impl Concurrency {
    pub fn new(queues: usize, queue_depth: usize) -> Self {
        Self {
            queues: queues.max(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Same depth, `factor` times the queues.
    pub fn scaled(&self, factor: usize) -> Self {
        Self::new(self.queues * factor, self.queue_depth)
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        let queues = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(queues, DEFAULT_QUEUE_DEPTH)
    }
}

/// Per-plugin configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Overrides the concurrency the plugin declares
    pub concurrency: Option<Concurrency>,
    /// Settings handed to the plugin on every call
    pub settings: toml::Table,
}

/// Stale connection reaper configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Maximum number of suspect connections queued between sweeps
    pub max_queue_size: usize,
    /// Sweep interval in seconds
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            interval_secs: 30,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Session manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Address of the session manager component
    pub component_id: String,
    /// Domains served locally
    pub local_domains: Vec<String>,
    /// Administrator accounts
    pub admins: Vec<String>,
    /// Trusted bare JIDs or domains
    pub trusted: Vec<String>,
    pub auth_timeout_secs: u64,
    pub close_grace_secs: u64,
    pub connection_check_timeout_secs: u64,
    /// Maximum connections per account, 0 for unlimited
    pub max_user_connections: usize,
    pub default_concurrency: Concurrency,
    /// Settings shared by every plugin, overridden by plugin specific ones
    pub common_settings: toml::Table,
    pub plugins: HashMap<String, PluginConfig>,
    pub reaper: ReaperConfig,
    /// Capacity of the outbound channel when the builder creates one
    pub sink_capacity: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            component_id: "sess-man@localhost".to_string(),
            local_domains: vec!["localhost".to_string()],
            admins: Vec::new(),
            trusted: Vec::new(),
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            close_grace_secs: DEFAULT_CLOSE_GRACE_SECS,
            connection_check_timeout_secs: DEFAULT_CONNECTION_CHECK_TIMEOUT_SECS,
            max_user_connections: 0,
            default_concurrency: Concurrency::default(),
            common_settings: toml::Table::new(),
            plugins: HashMap::new(),
            reaper: ReaperConfig::default(),
            sink_capacity: 10_000,
        }
    }
}

impl SessionManagerConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, XmppError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, XmppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(std::env::vars())?;
        debug!(path = %path.display(), "Loaded session manager configuration");
        Ok(config)
    }

    /// Apply `WADDLE_SM_*` overrides from the given variables.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), XmppError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "COMPONENT_ID" => self.component_id = value,
                "LOCAL_DOMAINS" => self.local_domains = split_list(&value),
                "ADMINS" => self.admins = split_list(&value),
                "TRUSTED" => self.trusted = split_list(&value),
                "AUTH_TIMEOUT_SECS" => self.auth_timeout_secs = parse_number(&key, &value)?,
                "CLOSE_GRACE_SECS" => self.close_grace_secs = parse_number(&key, &value)?,
                "MAX_USER_CONNECTIONS" => {
                    self.max_user_connections = parse_number(&key, &value)?
                }
                _ => continue,
            }
            debug!(key = %key, "Applied configuration override");
        }
        self.validate()
    }

    /// Check addresses and limits.
    pub fn validate(&self) -> Result<(), XmppError> {
        self.component_jid()?;
        self.admin_jids()?;
        if self.local_domains.is_empty() {
            return Err(XmppError::config("at least one local domain is required"));
        }
        if self.default_concurrency.queues == 0 || self.default_concurrency.queue_depth == 0 {
            return Err(XmppError::config("default concurrency must be positive"));
        }
        for (id, plugin) in &self.plugins {
            if let Some(c) = plugin.concurrency {
                if c.queues == 0 || c.queue_depth == 0 {
                    return Err(XmppError::config(format!(
                        "concurrency of plugin '{id}' must be positive"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn component_jid(&self) -> Result<Jid, XmppError> {
        Jid::new(&self.component_id).map_err(|e| {
            XmppError::config(format!("invalid component_id '{}': {e}", self.component_id))
        })
    }

    pub fn admin_jids(&self) -> Result<Vec<BareJid>, XmppError> {
        self.admins
            .iter()
            .map(|a| {
                BareJid::new(a)
                    .map_err(|e| XmppError::config(format!("invalid admin '{a}': {e}")))
            })
            .collect()
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    pub fn connection_check_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_check_timeout_secs)
    }

    /// Concurrency of a plugin: configured override, then the plugin's own
    /// declaration, then the default.
    ///
    /// Declared values are clamped to at least one queue of depth one;
    /// configured ones are checked by [`validate`](Self::validate).
    pub fn concurrency_for(&self, id: &str, declared: Option<Concurrency>) -> Concurrency {
        self.plugins
            .get(id)
            .and_then(|p| p.concurrency)
            .or(declared.map(|c| Concurrency::new(c.queues, c.queue_depth)))
            .unwrap_or(self.default_concurrency)
    }

    /// Settings for a plugin: common settings overlaid with plugin specific
    /// ones, plus `sm-jid`.
    pub fn settings_for(&self, id: &str) -> toml::Table {
        let mut settings = self.common_settings.clone();
        if let Some(plugin) = self.plugins.get(id) {
            for (key, value) in &plugin.settings {
                settings.insert(key.clone(), value.clone());
            }
        }
        settings.insert(
            "sm-jid".to_string(),
            toml::Value::String(self.component_id.clone()),
        );
        settings
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, XmppError> {
    value
        .trim()
        .parse()
        .map_err(|_| XmppError::config(format!("{key}: '{value}' is not a number")))
}
