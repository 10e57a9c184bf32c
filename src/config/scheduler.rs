//! Scheduler configuration: concurrency, queue and history bounds, pool capacities.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::WorkerPoolConfig;
use crate::util::serde::ResourceKind;

/// Prefix for environment variables read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "PROMETHEUS_SCHEDULER_";

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once.
    pub max_concurrent_tasks: usize,
    /// Maximum tasks waiting for admission before submissions are rejected.
    pub max_queue_depth: usize,
    /// Terminated tasks kept for inspection.
    pub history_capacity: usize,
    /// Timeout applied to tasks that do not set their own, in milliseconds.
    pub default_timeout_ms: Option<u64>,
    /// Capacity per resource pool.
    pub resources: BTreeMap<ResourceKind, f64>,
    /// Blocking worker threads.
    pub workers: WorkerPoolConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_queue_depth: 10_000,
            history_capacity: 1_000,
            default_timeout_ms: None,
            resources: ResourceKind::BUILTIN
                .iter()
                .cloned()
                .map(|kind| (kind, 1.0))
                .collect(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration: ceiling of 10, one pool of capacity 1.0 per
    /// built-in resource kind.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency ceiling.
    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    /// Set the queue depth limit.
    #[must_use]
    pub fn with_max_queue_depth(mut self, n: usize) -> Self {
        self.max_queue_depth = n;
        self
    }

    /// Set the history bound.
    #[must_use]
    pub fn with_history_capacity(mut self, n: usize) -> Self {
        self.history_capacity = n;
        self
    }

    /// Set the default task timeout, at millisecond resolution.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the capacity of one pool, adding it if absent.
    #[must_use]
    pub fn with_resource(mut self, kind: ResourceKind, capacity: f64) -> Self {
        self.resources.insert(kind, capacity);
        self
    }

    /// Set the worker pool configuration.
    #[must_use]
    pub fn with_workers(mut self, workers: WorkerPoolConfig) -> Self {
        self.workers = workers;
        self
    }

    /// Default task timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.history_capacity == 0 {
            return Err("history_capacity must be greater than 0".into());
        }
        if self.default_timeout_ms == Some(0) {
            return Err("default_timeout_ms must be greater than 0".into());
        }
        for (kind, capacity) in &self.resources {
            if !capacity.is_finite() || *capacity <= 0.0 {
                return Err(format!("capacity for `{kind}` must be positive, got {capacity}"));
            }
        }
        self.workers
            .validate()
            .map_err(|e| format!("workers invalid: {e}"))
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error description.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `PROMETHEUS_SCHEDULER_*` environment variables,
    /// loading a `.env` file first if one exists.
    ///
    /// # Errors
    ///
    /// Returns a description of the first unparsable or invalid value.
    pub fn from_env() -> Result<Self, String> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env file");
            }
        }
        Self::from_vars(std::env::vars())
    }

    /// Build configuration from `(name, value)` pairs using the
    /// `PROMETHEUS_SCHEDULER_*` names. Unrelated names are ignored.
    ///
    /// Recognized suffixes: `MAX_CONCURRENT_TASKS`, `MAX_QUEUE_DEPTH`,
    /// `HISTORY_CAPACITY`, `DEFAULT_TIMEOUT_MS`, `DEFAULT_TIMEOUT_SECS`, `WORKER_THREADS`,
    /// `WORKER_QUEUE_DEPTH`, and `CAPACITY_<KIND>` (kind lowercased, e.g.
    /// `CAPACITY_LLM_CALL=2.5`).
    ///
    /// # Errors
    ///
    /// Returns a description of the first unparsable or invalid value.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::default();
        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match key {
                "MAX_CONCURRENT_TASKS" => cfg.max_concurrent_tasks = parse_var(key, value)?,
                "MAX_QUEUE_DEPTH" => cfg.max_queue_depth = parse_var(key, value)?,
                "HISTORY_CAPACITY" => cfg.history_capacity = parse_var(key, value)?,
                "DEFAULT_TIMEOUT_MS" => cfg.default_timeout_ms = Some(parse_var(key, value)?),
                "DEFAULT_TIMEOUT_SECS" => {
                    let secs: u64 = parse_var(key, value)?;
                    cfg.default_timeout_ms = Some(secs.saturating_mul(1_000));
                }
                "WORKER_THREADS" => cfg.workers.worker_count = parse_var(key, value)?,
                "WORKER_QUEUE_DEPTH" => cfg.workers.max_queue_depth = parse_var(key, value)?,
                other => {
                    if let Some(kind) = other.strip_prefix("CAPACITY_") {
                        let kind = ResourceKind::from(kind.to_ascii_lowercase());
                        cfg.resources.insert(kind, parse_var(key, value)?);
                    } else {
                        tracing::debug!(variable = other, "ignoring unknown scheduler variable");
                    }
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{key}: cannot parse `{value}`: {e}"))
}
