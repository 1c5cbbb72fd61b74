//! Orchestrator configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! max_attempts = 3
//! worker_pool_size = 8
//! call_timeout_secs = 120
//! run_deadline_secs = 1800
//!
//! [[stages]]
//! id = "combined"
//! depends_on = ["section1", "section2"]
//! max_attempts = 2
//!
//! [[stages]]
//! id = "personas"
//! fan_out = 3
//! tolerance = "tolerant"
//!
//! [[edges]]
//! from = "combined"
//! to = "escalation"
//! when = "exhausted"
//! ```
//!
//! Apply it with [`WorkflowBuilder::configure`](crate::WorkflowBuilder::configure).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::workflow::{DEFAULT_MAX_ATTEMPTS, DEFAULT_WORKER_POOL_SIZE};
use crate::{EdgeCondition, HeddleError, Result, UnitTolerance};

/// Global orchestrator settings plus per-stage overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Attempt ceiling for stages without an override.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Concurrent units per stage without an override.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Timeout for each collaborator call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Deadline for a whole run, in seconds.
    #[serde(default)]
    pub run_deadline_secs: Option<u64>,

    /// Per-stage settings and dependencies.
    #[serde(default)]
    pub stages: Vec<StageConfig>,

    /// Conditional edges.
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

/// Settings for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// The stage name.
    pub id: String,

    /// Stages this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Attempt ceiling override.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Worker pool size override.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    /// Declared number of units.
    #[serde(default)]
    pub fan_out: Option<usize>,

    /// Unit tolerance override.
    #[serde(default)]
    pub tolerance: Option<UnitTolerance>,
}

/// A conditional edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    /// The upstream stage.
    pub from: String,

    /// The downstream stage.
    pub to: String,

    /// The condition on the upstream stage.
    #[serde(default)]
    pub when: EdgeCondition,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}

fn default_call_timeout_secs() -> u64 {
    120
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            worker_pool_size: default_worker_pool_size(),
            call_timeout_secs: default_call_timeout_secs(),
            run_deadline_secs: None,
            stages: Vec::new(),
            edges: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Toml`] on malformed input and
    /// [`HeddleError::Config`] on out-of-range values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HeddleError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.worker_pool_size == 0 {
            return Err(HeddleError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(HeddleError::Config(
                "call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.run_deadline_secs == Some(0) {
            return Err(HeddleError::Config(
                "run_deadline_secs must be at least 1".to_string(),
            ));
        }

        for stage in &self.stages {
            if stage.max_attempts == Some(0) {
                return Err(HeddleError::Config(format!(
                    "stage {}: max_attempts must be at least 1",
                    stage.id
                )));
            }
            if stage.worker_pool_size == Some(0) {
                return Err(HeddleError::Config(format!(
                    "stage {}: worker_pool_size must be at least 1",
                    stage.id
                )));
            }
        }

        Ok(())
    }

    /// Returns the per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Returns the run deadline, if any.
    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    /// Returns the settings of one stage.
    pub fn stage(&self, id: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|stage| stage.id == id)
    }
}
