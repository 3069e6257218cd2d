use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::agent::AgentProfile;
use crate::resolve::RetryPolicy;

pub const CONFIG_FILE: &str = "config.toml";
pub const RELAY_HOME_ENV: &str = "RELAY_HOME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not determine the home directory")]
    NoHome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Working directory for conversations with no override and no prior
    /// session.
    #[serde(default = "default_cwd")]
    pub default_cwd: PathBuf,

    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,

    /// Upper bound for an interactive run whose only job is to create a
    /// session.
    #[serde(default = "default_new_session_cap_ms")]
    pub new_session_cap_ms: u64,

    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// Where thread links and project overrides are persisted. In memory
    /// only when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    #[serde(default)]
    pub resolution: ResolutionConfig,

    #[serde(default = "default_agents")]
    pub agents: BTreeMap<String, AgentProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_cwd() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_turn_timeout_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_new_session_cap_ms() -> u64 {
    45_000
}

fn default_max_buffer_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_attempts() -> u32 {
    16
}

fn default_interval_ms() -> u64 {
    250
}

fn default_list_limit() -> usize {
    200
}

fn default_agents() -> BTreeMap<String, AgentProfile> {
    BTreeMap::from([("codex".to_string(), AgentProfile::codex())])
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval_ms: default_interval_ms(),
            list_limit: default_list_limit(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_cwd: default_cwd(),
            turn_timeout_ms: default_turn_timeout_ms(),
            new_session_cap_ms: default_new_session_cap_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
            shell: default_shell(),
            state_file: None,
            resolution: ResolutionConfig::default(),
            agents: default_agents(),
        }
    }
}

impl RelayConfig {
    /// Loads `path`, or the default location when `path` is `None`. A
    /// missing file at the default location means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path()?, false),
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default().expanded());
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        let config = Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), agents = config.agents.len(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(raw)?;
        Ok(config.expanded())
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    /// The turn timeout, capped for runs that only need to create a session.
    pub fn new_session_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms.min(self.new_session_cap_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.resolution.attempts,
            interval: Duration::from_millis(self.resolution.interval_ms),
        }
    }

    fn expanded(mut self) -> Self {
        self.default_cwd = expand_home(&self.default_cwd);
        self.state_file = self.state_file.as_deref().map(expand_home);
        for profile in self.agents.values_mut() {
            profile.sessions_dir = profile.sessions_dir.as_deref().map(expand_home);
            profile.index_db = profile.index_db.as_deref().map(expand_home);
        }
        self
    }
}

/// `$RELAY_HOME/config.toml`, else `~/.relay/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(home) = std::env::var_os(RELAY_HOME_ENV).filter(|home| !home.is_empty()) {
        return Ok(PathBuf::from(home).join(CONFIG_FILE));
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(".relay").join(CONFIG_FILE))
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
