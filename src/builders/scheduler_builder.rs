//! Builder to construct a scheduler from configuration.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::{AdmissionPredicate, AuditSink, Scheduler, SchedulerError, Spawn, TaskSnapshot};
use crate::runtime::TokioSpawner;

/// Assembles a [`Scheduler`] with optional collaborators.
///
/// ```rust,ignore
/// let audit = SharedAuditSink::new(1_000);
/// let scheduler = SchedulerBuilder::new(SchedulerConfig::from_env()?)
///     .audit_sink(audit.clone())
///     .admission_predicate(|task| task.priority >= Priority::Low)
///     .build()?;
/// ```
pub struct SchedulerBuilder<S = TokioSpawner> {
    config: SchedulerConfig,
    spawner: Option<S>,
    audit: Option<Box<dyn AuditSink>>,
    predicate: Option<AdmissionPredicate>,
}

impl SchedulerBuilder<TokioSpawner> {
    /// Start from a configuration. Without an explicit spawner the scheduler
    /// spawns onto the runtime that calls [`SchedulerBuilder::build`].
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            spawner: None,
            audit: None,
            predicate: None,
        }
    }
}

impl<S> SchedulerBuilder<S> {
    /// Use a custom spawner.
    #[must_use]
    pub fn spawner<T>(self, spawner: T) -> SchedulerBuilder<T> {
        SchedulerBuilder {
            config: self.config,
            spawner: Some(spawner),
            audit: self.audit,
            predicate: self.predicate,
        }
    }

    /// Record lifecycle transitions into `sink`.
    #[must_use]
    pub fn audit_sink(mut self, sink: impl AuditSink + 'static) -> Self {
        self.audit = Some(Box::new(sink));
        self
    }

    /// Install an admission predicate.
    #[must_use]
    pub fn admission_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TaskSnapshot) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Configuration the scheduler will be built from.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl SchedulerBuilder<TokioSpawner> {
    /// Build the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration and
    /// `SchedulerError::Runtime` when no spawner was given and the caller is
    /// not inside a tokio runtime.
    pub fn build(self) -> Result<Scheduler<TokioSpawner>, SchedulerError> {
        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => TokioSpawner::current()?,
        };
        Scheduler::from_parts(self.config, spawner, self.audit, self.predicate)
    }
}

impl<S> SchedulerBuilder<S>
where
    S: Spawn + Send + Sync + 'static,
{
    /// Build the scheduler with the custom spawner.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration or
    /// a missing spawner.
    pub fn build_with_spawner(self) -> Result<Scheduler<S>, SchedulerError> {
        let spawner = self
            .spawner
            .ok_or_else(|| SchedulerError::InvalidConfig("no spawner configured".into()))?;
        Scheduler::from_parts(self.config, spawner, self.audit, self.predicate)
    }
}

impl<S> std::fmt::Debug for SchedulerBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("audit", &self.audit.is_some())
            .field("predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}
