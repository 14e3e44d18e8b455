use serde::{Deserialize, Serialize};
use std::fs::File;
use types::ChainSpec;

pub const LOG_LEVEL: &str = "debug";

fn log_level() -> String {
    LOG_LEVEL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub default_dbname: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout_millis: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            dbname: "beacon_indexer".to_string(),
            default_dbname: "postgres".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            connect_timeout_millis: 2000,
        }
    }
}

impl DatabaseConfig {
    pub fn build_database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.dbname
        )
    }
}

/// One upstream beacon node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconNodeConfig {
    pub name: String,
    pub url: String,
    /// Lower values are preferred for state reads.
    pub priority: i32,
    /// Whether the node can serve historical states.
    pub archive: bool,
    /// Never query this node for duty computation.
    pub skip_validators: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Epochs kept in memory beyond finalization. Minimum 2.
    pub in_memory_epochs: u16,
    /// Epochs between unfinalized cache flushes. Minimum 2.
    pub cache_persistence_delay: u16,
    /// Concurrent beacon-state downloads. Minimum 2.
    pub max_parallel_validator_set_requests: u16,
    /// Read-only mode; caches are maintained but nothing is written.
    pub disable_index_writer: bool,
    /// Skip historical catch-up below the finalized checkpoint.
    pub disable_synchronizer: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            in_memory_epochs: 3,
            cache_persistence_delay: 4,
            max_parallel_validator_set_requests: 2,
            disable_index_writer: false,
            disable_synchronizer: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Store recovery-log block SSZ uncompressed.
    pub disable_block_compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Unix timestamp of the genesis slot.
    pub genesis_time: u64,
    /// Chain-spec overrides; unset values follow the mainnet preset.
    pub spec: ChainSpec,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            genesis_time: 0,
            spec: ChainSpec::mainnet(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "log_level")]
    pub log_level: String,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub beacon_nodes: Vec<BeaconNodeConfig>,
    pub indexer: IndexerConfig,
    pub kill_switch: KillSwitchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: log_level(),
            database: DatabaseConfig::default(),
            chain: ChainConfig::default(),
            beacon_nodes: Vec::new(),
            indexer: IndexerConfig::default(),
            kill_switch: KillSwitchConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file(path_to_file: String) -> Result<Config, String> {
        let file =
            File::open(path_to_file).map_err(|e| format!("Error reading config file: {:?}", e))?;
        let mut config: Config = serde_yaml::from_reader(file)
            .map_err(|e| format!("Error parsing config file: {:?}", e))?;
        config.clamp_minimums();
        Ok(config)
    }

    /// Enforce the documented minimums on the indexer options.
    pub fn clamp_minimums(&mut self) {
        let indexer = &mut self.indexer;
        indexer.in_memory_epochs = indexer.in_memory_epochs.max(2);
        indexer.cache_persistence_delay = indexer.cache_persistence_delay.max(2);
        indexer.max_parallel_validator_set_requests =
            indexer.max_parallel_validator_set_requests.max(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimums_are_clamped() {
        let mut config = Config {
            indexer: IndexerConfig {
                in_memory_epochs: 0,
                cache_persistence_delay: 1,
                max_parallel_validator_set_requests: 0,
                ..IndexerConfig::default()
            },
            ..Config::default()
        };
        config.clamp_minimums();

        assert_eq!(config.indexer.in_memory_epochs, 2);
        assert_eq!(config.indexer.cache_persistence_delay, 2);
        assert_eq!(config.indexer.max_parallel_validator_set_requests, 2);
    }

    #[test]
    fn default_log_level() {
        let config: Config = serde_yaml::from_str("database:\n  user: beacon").unwrap();
        assert_eq!(config.log_level, LOG_LEVEL);
        assert_eq!(config.database.user, "beacon");
        // Untouched sections keep their defaults.
        assert_eq!(config.database.port, 5432);
    }
}
