//! Application configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use tracing::warn;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::errors::ConfigError;
use crate::source::ReadPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InputConfig {
    /// Delimited input file; required
    pub file: Option<PathBuf>,
    /// Leading lines to ignore, e.g. a header row
    #[serde(default)]
    pub lines_to_skip: u64,
    #[serde(default)]
    pub read_policy: ReadPolicy,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of lanes launched
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    /// Lanes allowed to run at the same time
    #[serde(default = "default_lanes")]
    pub concurrency: usize,
    /// Records per bulk write
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Stop remaining lanes after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            concurrency: default_lanes(),
            chunk_size: default_chunk_size(),
            fail_fast: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Target table, created if missing
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_lanes() -> usize {
    10
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_table() -> String {
    "vehicle".to_string()
}

/// Values given on the command line, applied over file and environment
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub input_file: Option<PathBuf>,
    pub lines_to_skip: Option<u64>,
    pub read_policy: Option<ReadPolicy>,
    pub lanes: Option<usize>,
    pub concurrency: Option<usize>,
    pub chunk_size: Option<usize>,
    pub fail_fast: Option<bool>,
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Layer `config/default`, `VEHICLE_INGEST__*` variables and `overrides`
    pub fn load_with(overrides: Overrides) -> Result<Self, ConfigError> {
        let read_policy = overrides.read_policy.map(|p| match p {
            ReadPolicy::Partitioned => "partitioned",
            ReadPolicy::FullPass => "full_pass",
        });

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("VEHICLE_INGEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option(
                "input.file",
                overrides
                    .input_file
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .set_override_option("input.lines_to_skip", overrides.lines_to_skip.map(|v| v as i64))?
            .set_override_option("input.read_policy", read_policy)?
            .set_override_option("pipeline.lanes", overrides.lanes.map(|v| v as i64))?
            .set_override_option(
                "pipeline.concurrency",
                overrides.concurrency.map(|v| v as i64),
            )?
            .set_override_option("pipeline.chunk_size", overrides.chunk_size.map(|v| v as i64))?
            .set_override_option("pipeline.fail_fast", overrides.fail_fast)?
            .set_override_option("database.url", overrides.database_url)?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate everything needed before a lane starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.input.resolve()?;
        self.pipeline.validate()?;
        self.database.validate()?;
        Ok(())
    }
}

impl InputConfig {
    /// The input path, checked to be a readable file
    pub fn resolve(&self) -> Result<&Path, ConfigError> {
        let path = match self.file.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => path,
            _ => return Err(ConfigError::MissingInput),
        };

        let unreadable = |origin: String| ConfigError::UnreadableInput {
            path: path.display().to_string(),
            origin,
        };
        let metadata = std::fs::metadata(path).map_err(|e| unreadable(e.to_string()))?;
        if !metadata.is_file() {
            return Err(unreadable("not a regular file".to_string()));
        }
        std::fs::File::open(path).map_err(|e| unreadable(e.to_string()))?;
        Ok(path)
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes == 0 {
            return Err(ConfigError::Invalid {
                message: "Lane count must be greater than zero".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                message: "Concurrency must be greater than zero".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                message: "Chunk size must be greater than zero".to_string(),
            });
        }
        if self.concurrency > self.lanes {
            warn!(
                "Concurrency {} exceeds lane count {}, only {} lanes will run",
                self.concurrency, self.lanes, self.lanes
            );
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "Database URL cannot be empty".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                message: "Database pool needs at least one connection".to_string(),
            });
        }
        if !is_identifier(&self.table) {
            return Err(ConfigError::Invalid {
                message: format!("Invalid table name {:?}", self.table),
            });
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
