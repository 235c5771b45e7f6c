//! Runtime configuration of the query processor.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::BuilderConfig;
use crate::types::QuarryError;

/// When generated constraint checks run relative to the modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementTime {
    /// Guard the modify with conditional-execute checks.
    BeforeQueryExecution,
    /// Run the modify unguarded and validate touched entities at commit.
    AfterQueryExecution,
}

/// Heuristic join-ordering knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOrderConfig {
    /// Join count at which joins are gathered into a multi-join and reordered heuristically.
    pub min_join_count: usize,
    /// Produce bushy trees instead of left-deep ones.
    pub bushy: bool,
}

impl Default for JoinOrderConfig {
    fn default() -> Self {
        Self {
            min_join_count: 6,
            bushy: false,
        }
    }
}

/// Budget of the cost-based search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolcanoConfig {
    /// Maximum rule firings during exploration.
    pub max_iterations: Option<usize>,
    /// Wall-clock bound on exploration in milliseconds.
    pub deadline_ms: Option<u64>,
}

/// Configuration consumed by [`crate::processing::QueryProcessor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Cache prepared results of queries.
    pub implementation_caching: bool,
    /// Cache prepared results of DML statements.
    pub implementation_caching_dml: bool,
    /// Cache optimized physical trees of queries.
    pub query_plan_caching: bool,
    /// Cache optimized physical trees of DML statements.
    pub query_plan_caching_dml: bool,
    /// Cache router decisions per query signature and partitions.
    pub routing_plan_caching: bool,
    /// Entries per cache.
    pub cache_capacity: usize,
    /// Shards per cache.
    pub cache_shards: usize,
    /// When checks run.
    pub constraint_enforcement: EnforcementTime,
    /// Enforce UNIQUE and PRIMARY KEY constraints.
    pub unique_constraint_enforcement: bool,
    /// Enforce FOREIGN KEY constraints.
    pub foreign_key_enforcement: bool,
    /// Run the decorrelation program even when not needed for implementation.
    pub force_decorrelate: bool,
    /// Rule firings allowed per deterministic pass; unbounded when `None`.
    pub hep_match_limit: Option<usize>,
    /// Bound on router fan-out in milliseconds.
    pub router_deadline_ms: Option<u64>,
    /// Heuristic join ordering.
    pub join_order: JoinOrderConfig,
    /// Cost-based search budget.
    pub volcano: VolcanoConfig,
    /// Tree builder knobs.
    pub builder: BuilderConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            implementation_caching: true,
            implementation_caching_dml: true,
            query_plan_caching: true,
            query_plan_caching_dml: true,
            routing_plan_caching: true,
            cache_capacity: 1024,
            cache_shards: 8,
            constraint_enforcement: EnforcementTime::BeforeQueryExecution,
            unique_constraint_enforcement: false,
            foreign_key_enforcement: false,
            force_decorrelate: false,
            hep_match_limit: None,
            router_deadline_ms: None,
            join_order: JoinOrderConfig::default(),
            volcano: VolcanoConfig::default(),
            builder: BuilderConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Every cache off; useful when measuring the optimizer itself.
    pub fn benchmark() -> Self {
        Self {
            implementation_caching: false,
            implementation_caching_dml: false,
            query_plan_caching: false,
            query_plan_caching_dml: false,
            routing_plan_caching: false,
            ..Self::default()
        }
    }

    /// All constraint checks on, enforced before execution.
    pub fn strict() -> Self {
        Self {
            unique_constraint_enforcement: true,
            foreign_key_enforcement: true,
            constraint_enforcement: EnforcementTime::BeforeQueryExecution,
            ..Self::default()
        }
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `path`, else the default location, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path.map(Path::to_path_buf).or_else(default_path) {
            Some(p) if p.exists() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    /// Serializes to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_shards == 0 {
            return Err(ConfigError::Invalid {
                key: "cache_shards",
                reason: "must be at least 1".into(),
            });
        }
        if self.cache_capacity < self.cache_shards {
            return Err(ConfigError::Invalid {
                key: "cache_capacity",
                reason: format!("must be at least cache_shards ({})", self.cache_shards),
            });
        }
        if self.join_order.min_join_count < 2 {
            return Err(ConfigError::Invalid {
                key: "join_order.min_join_count",
                reason: "must be at least 2".into(),
            });
        }
        Ok(())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// TOML did not parse into the configuration.
    #[error("failed to parse config{}: {source}", .path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File path, when loading from disk.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Configuration could not be serialized.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<ConfigError> for QuarryError {
    fn from(err: ConfigError) -> Self {
        QuarryError::Config(err.to_string())
    }
}

/// `$CONFIG_DIR/quarry/processor.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("quarry").join("processor.toml"))
}
