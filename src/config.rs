//! Layered application configuration.
//!
//! Precedence, lowest first: built-in defaults, `siteback.toml` (or `--config`),
//! `SITEBACK_*` environment variables (`__` separates nested keys), CLI overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::checkpoint::CheckpointStore;
use crate::core::models::DigestAlgorithm;
use crate::core::procedures::ProcedureTemplates;
use crate::core::remote::RemoteEndpoint;
use crate::core::retry::RetryPolicy;
use crate::core::session::SessionSettings;
use crate::core::transfer_engine::{EngineSettings, ExistingDestinationPolicy};
use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "siteback.toml";
pub const ENV_PREFIX: &str = "SITEBACK_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_secs: u64,
    pub command_secs: u64,
    pub create_backup_secs: u64,
    pub restore_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 15,
            command_secs: 300,
            create_backup_secs: 1800,
            restore_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_health_check_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_health_check_secs: 60,
            keepalive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub interval_ms: u64,
    pub capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub digest: DigestAlgorithm,
    pub verify_source_digest: bool,
    pub existing_destination: ExistingDestinationPolicy,
    /// Member transfers in flight at once. 1 is sequential.
    pub concurrency: usize,
    /// Local sets `prune` keeps when no count is given.
    pub keep_local_sets: usize,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    pub session: SessionConfig,
    pub progress: ProgressConfig,
    pub endpoints: Vec<RemoteEndpoint>,
    pub procedures: ProcedureTemplates,
    pub log: LogSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./backups"),
            index_path: None,
            checkpoint_dir: None,
            chunk_size: 32 * 1024,
            digest: DigestAlgorithm::Sha256,
            verify_source_digest: true,
            existing_destination: ExistingDestinationPolicy::Reverify,
            concurrency: 1,
            keep_local_sets: 5,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            session: SessionConfig::default(),
            progress: ProgressConfig::default(),
            endpoints: Vec::new(),
            procedures: ProcedureTemplates::default(),
            log: LogSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from the default file in the working directory, the environment and `overrides`.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load(None, overrides)
    }

    /// Like [`AppConfig::new`], reading `file` instead of the default. An explicit
    /// file that does not exist is an error.
    pub fn load<T: Serialize>(file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        figment = match file {
            Some(path) if !path.exists() => {
                return Err(Error::Config(format!("config file {} does not exist", path.display())));
            }
            Some(path) => figment.merge(Toml::file(path)),
            None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        };

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.keep_local_sets == 0 {
            return Err(Error::Config("keep_local_sets must be at least 1".into()));
        }
        let mut names: Vec<&str> = self.endpoints.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("endpoint `{}` is defined more than once", pair[0])));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.storage_path.join("index.db"))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.storage_path.join(".checkpoints"))
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.checkpoint_dir())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            chunk_size: self.chunk_size,
            digest: self.digest,
            verify_source_digest: self.verify_source_digest,
            existing_destination: self.existing_destination,
            ..EngineSettings::default()
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            command_timeout: Duration::from_secs(self.timeouts.command_secs),
            idle_health_check: Duration::from_secs(self.session.idle_health_check_secs),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress.interval_ms)
    }

    pub fn endpoint(&self, name: &str) -> Result<&RemoteEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::Config(format!("no endpoint named `{name}`")))
    }
}
