use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "./stampede_config.yaml";

#[derive(Deserialize, Default)]
/// Root config for a stampede node.  Can be part of a larger config file.
pub struct RootConfig {
    #[serde(default)]
    pub node: NodeTunables,
}

impl RootConfig {
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// `STAMPEDE_`-prefixed environment variables override the YAML file;
    /// both are optional.
    pub fn load_from_path(path: &str) -> Self {
        let mut f = figment::Figment::from(Env::prefixed("STAMPEDE_").map(|k| {
            k.as_str().replace("__", ".").into()
        }));
        if std::path::Path::new(path).exists() {
            f = figment::Figment::from(Yaml::file(path)).merge(f);
        }
        match f.extract() {
            Ok(config) => config,
            Err(e) => panic!("Error loading config: {}", e),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct NodeTunables {
    pub gossip_interval_ms: u64,
    pub gossip_fanout: usize,
    pub poll_timeout_ms: u64,
    pub max_bind_attempts: u16,
    pub snapshot_interval_secs: u64,
    pub snapshot_ttl_secs: u64,
    pub peer_snapshot_interval_secs: u64,
}

impl Default for NodeTunables {
    fn default() -> Self {
        NodeTunables {
            gossip_interval_ms: 2000,
            gossip_fanout: 4,
            poll_timeout_ms: 2000,
            max_bind_attempts: 100,
            snapshot_interval_secs: 30,
            snapshot_ttl_secs: 120 * 60,
            peer_snapshot_interval_secs: 60,
        }
    }
}

impl NodeTunables {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn peer_snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.peer_snapshot_interval_secs)
    }
}
