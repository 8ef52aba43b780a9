use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level node configuration, loaded from (and saved to) a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub task_controller: TaskControllerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub default_port: u16,
    pub connection_timeout_secs: u64,
    pub max_connections: usize,
    pub bootstrap_nodes: Vec<BootstrapNode>,
    pub replication_factor: usize,
    pub dht_storage: DHTStorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub peer_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DHTStorageConfig {
    pub db_path: Option<PathBuf>,
    pub cache_size: usize,
    pub cleanup_interval_secs: u64,
    pub default_ttl_secs: u64,
}

/// Reed-Solomon storage mode selected at upload time (§4.7 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// One segment holds the whole file.
    FileMode,
    /// Fixed-size slices, no parity.
    SliceMode,
    /// Explicit (data_shards, parity_shards).
    RsSize,
    /// Derive (data_shards, parity_shards) from a target parity ratio.
    RsProportion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub keys_dir: Option<PathBuf>,
    pub slice_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub default_mode: StorageMode,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Used by `RsProportion`: parity_shards ≈ total_shards * parity_ratio.
    pub parity_ratio: f64,
    pub min_upload_size: usize,
    pub max_upload_size: usize,
    pub min_slice_size: usize,
    pub max_slice_size: usize,
    pub shard_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub key_algorithm: String,
    pub verify_integrity: bool,
    pub encryption_strength: String,
}

/// Task controller tuning (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskControllerConfig {
    pub max_workers: usize,
    pub min_workers: usize,
    pub queue_size: usize,
    pub retry_times: usize,
    pub task_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub metrics_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub structured: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                default_port: 40871,
                connection_timeout_secs: 30,
                max_connections: 100,
                bootstrap_nodes: vec![],
                replication_factor: 3,
                dht_storage: DHTStorageConfig {
                    db_path: None,
                    cache_size: 1000,
                    cleanup_interval_secs: 24 * 60 * 60,
                    default_ttl_secs: 24 * 60 * 60,
                },
            },
            storage: StorageConfig {
                keys_dir: None,
                slice_dir: None,
                download_dir: None,
                default_mode: StorageMode::RsSize,
                data_shards: 4,
                parity_shards: 2,
                parity_ratio: 0.5,
                min_upload_size: 1,
                max_upload_size: 10 * 1024 * 1024 * 1024,
                min_slice_size: 64 * 1024,
                max_slice_size: 16 * 1024 * 1024,
                shard_size: 1024 * 1024,
            },
            security: SecurityConfig {
                key_algorithm: "secp256k1".to_string(),
                verify_integrity: true,
                encryption_strength: "aes256gcm".to_string(),
            },
            task_controller: TaskControllerConfig {
                max_workers: 16,
                min_workers: 2,
                queue_size: 1024,
                retry_times: 3,
                task_timeout_secs: 300,
                shutdown_timeout_secs: 30,
                metrics_interval_secs: 60,
                cleanup_interval_secs: 3600,
                max_concurrent_uploads: 8,
                max_concurrent_downloads: 8,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                structured: true,
                log_file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults.
    pub fn load_or_default(config_path: Option<PathBuf>) -> crate::error::MeshResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&config_str)
                    .map_err(|e| crate::error::MeshError::Config(format!("parse error: {}", e)))?;
                tracing::info!("loaded configuration from {:?}", path);
                return Ok(config);
            }
        }

        tracing::info!("using default configuration");
        Ok(Config::default())
    }

    /// Save configuration to file.
    pub fn save(&self, config_path: &PathBuf) -> crate::error::MeshResult<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| crate::error::MeshError::Config(format!("serialize error: {}", e)))?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("configuration saved to {:?}", config_path);
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connection_timeout_secs)
    }

    /// Root of the persistent on-disk layout (§6): `<root>/defsdata/...`.
    pub fn data_root(&self) -> PathBuf {
        match &self.storage.slice_dir {
            Some(p) => p.parent().map(Path::to_path_buf).unwrap_or_else(|| p.clone()),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("meshfs"),
        }
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_root().join("defsdata").join("database")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.storage
            .keys_dir
            .clone()
            .unwrap_or_else(|| self.data_root().join("defsdata").join("keys"))
    }

    pub fn slices_dir(&self, host_id: &str) -> PathBuf {
        self.data_root().join("defsdata").join("slices").join(host_id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root().join("defsdata").join("logs")
    }

    pub fn download_root(&self) -> PathBuf {
        self.storage
            .download_dir
            .clone()
            .unwrap_or_else(|| dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")))
    }
}
