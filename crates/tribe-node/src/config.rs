//! Tribe node configuration.

use crate::blocks::BlockPolicy;
use crate::conflict::ConflictPolicy;
use crate::error::{Result, TribeError};
use crate::namespace::SEPARATOR;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// One member cluster the tribe node joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Alias of the member cluster; appended to its node names.
    pub alias: String,
    /// Seed addresses tried in order when connecting.
    pub seeds: Vec<String>,
}

impl RemoteConfig {
    /// Create a remote with the given alias and seeds.
    pub fn new(alias: &str, seeds: &[&str]) -> Self {
        Self {
            alias: alias.to_string(),
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Blocks applied to requests entering the tribe node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocksConfig {
    /// Block every write.
    pub write: bool,
    /// Block every metadata change.
    pub metadata: bool,
    /// Block writes to indices matching any of these globs.
    #[serde(deserialize_with = "one_or_many")]
    pub write_indices: Vec<String>,
}

/// Settings for the links to member clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bound on a single connection attempt (ms).
    pub connect_timeout_ms: u64,
    /// Initial reconnect delay (ms).
    pub reconnect_delay_ms: u64,
    /// Max reconnect delay (ms) after backoff.
    pub max_reconnect_delay_ms: u64,
    /// Randomize reconnect delays.
    pub jitter: bool,
    /// Capacity of the event queue into the aggregator.
    pub channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 30000,
            jitter: true,
            channel_capacity: 1024,
        }
    }
}

impl LinkConfig {
    /// Connection attempt bound as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Top-level tribe node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TribeConfig {
    /// Name of this node; appears bare in the merged view.
    pub node_name: String,
    /// Conflict policy for index names reported by several members.
    pub on_conflict: ConflictPolicy,
    /// How long startup waits for every member to sync (ms).
    pub initial_state_timeout_ms: u64,
    /// Address for the JSON-lines request listener, if any.
    pub listen_addr: Option<String>,
    /// Request blocks.
    pub blocks: BlocksConfig,
    /// Member clusters.
    pub remotes: Vec<RemoteConfig>,
    /// Link settings shared by every member.
    pub link: LinkConfig,
}

impl Default for TribeConfig {
    fn default() -> Self {
        Self {
            node_name: "tribe_node".to_string(),
            on_conflict: ConflictPolicy::Drop,
            initial_state_timeout_ms: 30000,
            listen_addr: None,
            blocks: BlocksConfig::default(),
            remotes: Vec::new(),
            link: LinkConfig::default(),
        }
    }
}

impl TribeConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TribeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| TribeError::Config {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(TribeError::Config {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Initial state wait as a duration.
    pub fn initial_state_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_state_timeout_ms)
    }

    /// Add a member cluster.
    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remotes.push(remote);
        self
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(TribeError::Config { reason });

        if self.node_name.is_empty() {
            return invalid("node_name cannot be empty".to_string());
        }

        let mut aliases = HashSet::new();
        for remote in &self.remotes {
            if remote.alias.is_empty() {
                return invalid("remote alias cannot be empty".to_string());
            }
            if remote.alias.contains(SEPARATOR) {
                return invalid(format!(
                    "remote alias [{}] cannot contain [{}]",
                    remote.alias, SEPARATOR
                ));
            }
            if !aliases.insert(remote.alias.as_str()) {
                return invalid(format!("duplicate remote alias [{}]", remote.alias));
            }
            if remote.seeds.is_empty() {
                return invalid(format!("remote [{}] has no seed addresses", remote.alias));
            }
        }

        if let Some(preferred) = self.on_conflict.preferred_alias() {
            if !aliases.contains(preferred) {
                return invalid(format!(
                    "on_conflict prefers [{}] which is not a configured remote",
                    preferred
                ));
            }
        }

        BlockPolicy::new(&self.blocks)?;

        if self.link.reconnect_delay_ms == 0 {
            return invalid("link.reconnect_delay_ms must be > 0".to_string());
        }
        if self.link.max_reconnect_delay_ms < self.link.reconnect_delay_ms {
            return invalid(
                "link.max_reconnect_delay_ms must be >= link.reconnect_delay_ms".to_string(),
            );
        }
        if self.link.channel_capacity == 0 {
            return invalid("link.channel_capacity must be > 0".to_string());
        }

        Ok(())
    }
}

/// Accepts either a list of strings or one comma-separated string.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect(),
        OneOrMany::Many(v) => v,
    })
}
