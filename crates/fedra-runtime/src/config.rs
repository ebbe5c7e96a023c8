//! Runtime configuration, loadable from TOML.
//!
//! ```toml
//! [pipeline]
//! enabled = true
//! max_sweeps = 32
//!
//! [federating]
//! partial_tolerant = ["federated_sum"]
//!
//! [local]
//! max_fanout = 8
//!
//! [remote]
//! workers = ["10.0.0.2:7070", "10.0.0.3:7070"]
//! rpc_deadline_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use fedra_compile::{pass_by_name, PassManager, DEFAULT_MAX_SWEEPS};
use fedra_core::Intrinsic;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pipeline: PipelineConfig,
    pub caching: CachingConfig,
    pub federating: FederatingConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
}

/// Whether and how computations are rewritten before execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub max_sweeps: usize,
    /// Pass names in sweep order. Empty selects the standard pipeline.
    pub passes: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sweeps: DEFAULT_MAX_SWEEPS,
            passes: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Build the configured pass manager, or `None` when disabled.
    pub fn pass_manager(&self) -> Result<Option<PassManager>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut pm = if self.passes.is_empty() {
            PassManager::default_pipeline()
        } else {
            let mut pm = PassManager::new();
            for name in &self.passes {
                let pass = pass_by_name(name)
                    .ok_or_else(|| ExecutorError::Config(format!("unknown pass `{name}`")))?;
                pm.add_boxed(pass);
            }
            pm
        };
        pm = pm.with_max_sweeps(self.max_sweeps);
        Ok(Some(pm))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    pub enabled: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Participant failure policy.
///
/// Every intrinsic fails as a whole when any participant fails, except the
/// aggregations listed here, which drop failed clients and aggregate the rest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatingConfig {
    /// Intrinsic uris, e.g. `"federated_mean"`.
    pub partial_tolerant: Vec<String>,
}

impl FederatingConfig {
    pub fn with_partial_tolerance(mut self, intrinsic: Intrinsic) -> Self {
        if !self.tolerates(intrinsic) {
            self.partial_tolerant.push(intrinsic.uri().to_string());
        }
        self
    }

    pub fn tolerates(&self, intrinsic: Intrinsic) -> bool {
        intrinsic.is_aggregation() && self.partial_tolerant.iter().any(|u| u == intrinsic.uri())
    }

    /// Policy for the child federations under a composing executor.
    ///
    /// Shards of a mean are reduced with `federated_sum`, so a tolerant mean
    /// needs tolerant shard sums. The composing executor still fails a sum it
    /// does not tolerate itself when a shard reports missing clients.
    pub fn for_shards(&self) -> Self {
        if self.tolerates(Intrinsic::FederatedMean) {
            self.clone().with_partial_tolerance(Intrinsic::FederatedSum)
        } else {
            self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        for uri in &self.partial_tolerant {
            match Intrinsic::from_uri(uri) {
                Some(i) if i.is_aggregation() => {}
                Some(_) => {
                    return Err(ExecutorError::Config(format!(
                        "`{uri}` is not an aggregation and cannot tolerate partial failure"
                    )))
                }
                None => return Err(ExecutorError::Config(format!("unknown intrinsic `{uri}`"))),
            }
        }
        Ok(())
    }
}

/// In-process topology.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Most clients a single federating executor drives directly.
    pub max_fanout: usize,
    /// Run each leaf on its own thread.
    pub thread_delegating: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_fanout: 16,
            thread_delegating: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Executor service addresses. Empty means a local topology.
    pub workers: Vec<String>,
    pub rpc_deadline_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            rpc_deadline_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl RemoteConfig {
    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_deadline_ms)
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ExecutorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ExecutorError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local.max_fanout == 0 {
            return Err(ExecutorError::Config("local.max_fanout must be at least 1".into()));
        }
        if self.remote.rpc_deadline_ms == 0 {
            return Err(ExecutorError::Config("remote.rpc_deadline_ms must be positive".into()));
        }
        self.federating.validate()?;
        self.pipeline.pass_manager()?;
        Ok(())
    }

    pub fn with_max_fanout(mut self, max_fanout: usize) -> Self {
        self.local.max_fanout = max_fanout;
        self
    }

    pub fn with_thread_delegating(mut self, enabled: bool) -> Self {
        self.local.thread_delegating = enabled;
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching.enabled = enabled;
        self
    }

    pub fn with_pipeline(mut self, enabled: bool) -> Self {
        self.pipeline.enabled = enabled;
        self
    }

    pub fn with_partial_tolerance(mut self, intrinsic: Intrinsic) -> Self {
        self.federating = self.federating.with_partial_tolerance(intrinsic);
        self
    }

    pub fn with_workers(mut self, workers: Vec<String>) -> Self {
        self.remote.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.remote.retry = retry;
        self
    }

    pub fn with_rpc_deadline(mut self, deadline: Duration) -> Self {
        self.remote.rpc_deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
