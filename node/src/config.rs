use anyhow::{bail, Context, Result};
use config::{Config, Environment, File as ConfigFile};
use fidoreg_crypto::{DomainSettings, SigningConfig};
use fidoreg_lifecycle::LifecycleConfig;
use fidoreg_replication::{ReplicationConfig, ReplicationMode};
use fidoreg_security::FieldLimits;
use fidoreg_types::ServerId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/node.toml";
const ENV_PREFIX: &str = "FIDOREG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub bind: String,
    /// Listener for peer replication traffic; only opened when replication
    /// is enabled.
    pub peer_bind: String,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8181".to_string(),
            peer_bind: "127.0.0.1:8182".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectorySection {
    pub sync: bool,
}

/// Full node configuration: file, then `FIDOREG_*` environment, then CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server_id: ServerId,
    pub node_id: String,
    pub data_dir: PathBuf,
    pub rpc: RpcSection,
    pub log: LogSection,
    pub limits: FieldLimits,
    pub signing: SigningConfig,
    pub domains: Vec<DomainSettings>,
    pub replication: ReplicationConfig,
    pub directory: DirectorySection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            node_id: "fidoreg-node".to_string(),
            data_dir: PathBuf::from("./data"),
            rpc: RpcSection::default(),
            log: LogSection::default(),
            limits: FieldLimits::default(),
            signing: SigningConfig::default(),
            domains: Vec::new(),
            replication: ReplicationConfig::default(),
            directory: DirectorySection::default(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("replication.peers"),
        );

        let config = builder.build().context("failed to assemble configuration")?;
        config
            .try_deserialize::<AppConfig>()
            .context("invalid configuration")
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            server_id: self.server_id,
            limits: self.limits,
            directory_sync: self.directory.sync,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id == 0 {
            bail!("server_id must be a positive integer");
        }
        if self.data_dir.as_os_str().is_empty() {
            bail!("data_dir must not be empty");
        }
        if self.limits.short_string == 0 || self.limits.long_string == 0 {
            bail!("field limits must be positive");
        }
        if !matches!(self.log.format.as_str(), "pretty" | "json") {
            bail!("log.format must be `pretty` or `json`, got `{}`", self.log.format);
        }
        if self.signing.standalone && self.signing.keystore_password.is_none() {
            bail!("signing.standalone requires signing.keystore_password");
        }
        if self.replication.mode != ReplicationMode::Disabled {
            if self
                .replication
                .peer_token
                .as_deref()
                .map_or(true, |token| token.trim().is_empty())
            {
                bail!("replication requires replication.peer_token");
            }
            if self.rpc.peer_bind == self.rpc.bind {
                bail!("rpc.peer_bind must differ from rpc.bind");
            }
        }
        if self.signing.enabled && self.domains.is_empty() {
            warn!("integrity signing is enabled but no domains are configured");
        }
        if self.replication.mode == ReplicationMode::Full && self.replication.peers.is_empty() {
            warn!("full replication configured without peers; events will not leave this node");
        }
        Ok(())
    }
}

pub fn ensure_data_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create data directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture_config() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join("node.toml")
    }

    #[test]
    fn bundled_config_loads() {
        let path = fixture_config();
        let config = AppConfig::load(path.to_str()).unwrap();
        assert_eq!(config.server_id, 1);
        assert_eq!(config.rpc.bind, "127.0.0.1:8181");
        assert_eq!(config.rpc.peer_bind, "127.0.0.1:8182");
        assert_eq!(config.limits.short_string, 256);
        assert_eq!(config.limits.long_string, 512);
        assert_eq!(config.domains.len(), 1);
        assert_eq!(config.replication.mode, ReplicationMode::Disabled);
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_is_reported() {
        let err = AppConfig::load(Some("/nonexistent/fidoreg.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "server_id = 7\n[replication]\nmode = \"full\"").unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.server_id, 7);
        assert_eq!(config.replication.mode, ReplicationMode::Full);
        assert_eq!(config.replication.ack_timeout_ms, 5_000);
        assert_eq!(config.replication.max_backoff_ms, 30_000);
        assert!(config.replication.peer_token.is_none());
        assert_eq!(config.log.format, "pretty");
        assert!(!config.directory.sync);
        assert_eq!(config.lifecycle().server_id, 7);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let config = AppConfig {
            server_id: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("server_id"));

        let mut config = AppConfig::default();
        config.signing.standalone = true;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("keystore_password"));

        let mut config = AppConfig::default();
        config.log.format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.replication.mode = ReplicationMode::Full;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("peer_token"));
        config.replication.peer_token = Some("cluster-secret".into());
        config.validate().unwrap();
        config.rpc.peer_bind = config.rpc.bind.clone();
        assert!(config.validate().is_err());
    }
}
