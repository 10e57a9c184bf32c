//! Load monitor driving the concurrency ceiling.
//!
//! [`ConcurrencyController`] holds the decision logic and never touches a
//! scheduler, so it can be exercised with synthetic samples. [`LoadMonitor`]
//! feeds it real samples on an interval and applies its decisions through
//! [`Scheduler::set_max_concurrent_tasks`].

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MonitorConfig;
use crate::core::executor::Spawn;
use crate::core::scheduler::Scheduler;
use crate::core::SchedulerError;

/// One observation of scheduler load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// Highest `(allocated + reserved) / capacity` across pools.
    pub utilization: f64,
    /// Tasks waiting for admission.
    pub queued: usize,
    /// Tasks running or paused.
    pub active: usize,
}

impl LoadSample {
    /// Sample a scheduler.
    #[must_use]
    pub fn collect<S>(scheduler: &Scheduler<S>) -> Self
    where
        S: Spawn + Send + Sync + 'static,
    {
        let stats = scheduler.stats();
        let utilization = scheduler
            .resource_snapshot()
            .iter()
            .map(|p| p.utilization)
            .fold(0.0, f64::max);
        Self {
            utilization,
            queued: stats.queued,
            active: stats.active,
        }
    }
}

/// Hysteresis policy for the concurrency ceiling.
///
/// Raises by one after `stable_samples` consecutive samples at or below the
/// low watermark while work is queued, lowers by one after `stable_samples`
/// consecutive samples at or above the high watermark, then ignores
/// `cooldown_samples` samples.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    config: MonitorConfig,
    current: usize,
    low_streak: u32,
    high_streak: u32,
    cooldown: u32,
}

impl ConcurrencyController {
    /// Start from `current`, clamped to the configured bounds.
    #[must_use]
    pub fn new(config: MonitorConfig, current: usize) -> Self {
        let current = current.clamp(config.min_concurrency, config.max_concurrency);
        Self {
            config,
            current,
            low_streak: 0,
            high_streak: 0,
            cooldown: 0,
        }
    }

    /// Ceiling the controller believes is in effect.
    #[must_use]
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Adopt a ceiling set by someone else. Streaks restart.
    pub fn sync(&mut self, current: usize) {
        if current != self.current {
            self.current = current;
            self.low_streak = 0;
            self.high_streak = 0;
        }
    }

    /// Fold in a sample. Returns the new ceiling when it should change.
    pub fn observe(&mut self, sample: &LoadSample) -> Option<usize> {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            return None;
        }

        if sample.utilization >= self.config.high_watermark {
            self.high_streak += 1;
            self.low_streak = 0;
        } else if sample.utilization <= self.config.low_watermark && sample.queued > 0 {
            self.low_streak += 1;
            self.high_streak = 0;
        } else {
            self.low_streak = 0;
            self.high_streak = 0;
        }

        let target = if self.high_streak >= self.config.stable_samples {
            self.current.saturating_sub(1).max(self.config.min_concurrency)
        } else if self.low_streak >= self.config.stable_samples {
            (self.current + 1).min(self.config.max_concurrency)
        } else {
            return None;
        };

        self.low_streak = 0;
        self.high_streak = 0;
        if target == self.current {
            return None;
        }
        self.current = target;
        self.cooldown = self.config.cooldown_samples;
        Some(target)
    }
}

/// Background sampler adjusting a scheduler's concurrency ceiling.
pub struct LoadMonitor;

impl LoadMonitor {
    /// Start sampling `scheduler` on the current tokio runtime.
    ///
    /// The monitor stops when the returned handle is stopped or dropped, or
    /// when the scheduler shuts down.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration and
    /// `SchedulerError::Runtime` outside a tokio runtime.
    pub fn spawn<S>(scheduler: Scheduler<S>, config: MonitorConfig) -> Result<MonitorHandle, SchedulerError>
    where
        S: Spawn + Send + Sync + 'static,
    {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulerError::Runtime(format!("load monitor needs a tokio runtime: {e}")))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = config.interval();
        let mut controller = ConcurrencyController::new(config, scheduler.max_concurrent_tasks());

        let join = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(interval_ms = interval.as_millis(), "load monitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if scheduler.is_shut_down() {
                    break;
                }
                controller.sync(scheduler.max_concurrent_tasks());
                let sample = LoadSample::collect(&scheduler);
                let Some(next) = controller.observe(&sample) else {
                    continue;
                };
                match scheduler.set_max_concurrent_tasks(next) {
                    Ok(()) => tracing::info!(
                        ceiling = next,
                        utilization = sample.utilization,
                        queued = sample.queued,
                        "load monitor adjusted concurrency"
                    ),
                    Err(e) => tracing::warn!(error = %e, "load monitor failed to adjust concurrency"),
                }
            }
            tracing::debug!("load monitor stopped");
        });

        Ok(MonitorHandle { stop_tx, join })
    }
}

/// Handle to a running [`LoadMonitor`].
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for its loop to exit.
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "load monitor task ended abnormally");
        }
    }
}
