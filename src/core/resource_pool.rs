//! Capacity accounting for a single resource dimension.
//!
//! A [`ResourcePool`] tracks `capacity`, the sum of live per-task allocations,
//! and soft reservations held outside the allocation path. Every mutation runs
//! under the pool's own `parking_lot::Mutex`, so concurrent callers never see a
//! half-applied allocation. No operation fails: under-capacity is expressed by
//! granting less than requested, and the caller decides whether that is enough.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::SchedulerError;
use crate::util::serde::{ResourceKind, TaskId};

/// Tolerance used for floating point capacity comparisons.
pub const EPSILON: f64 = 1e-9;

/// Rolling usage metrics sampled on every allocate/release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    /// Highest `allocated` value ever observed.
    pub peak_allocated: f64,
    /// Running mean of `allocated` across samples.
    pub average_allocated: f64,
    /// Number of samples folded into the mean.
    pub samples: u64,
}

impl PoolMetrics {
    fn sample(&mut self, allocated: f64) {
        self.samples += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.samples as f64;
        self.average_allocated += (allocated - self.average_allocated) / n;
        if allocated > self.peak_allocated {
            self.peak_allocated = allocated;
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    /// Resource dimension.
    pub kind: ResourceKind,
    /// Total capacity in relative units.
    pub capacity: f64,
    /// Sum of live allocations.
    pub allocated: f64,
    /// Capacity held by reservations.
    pub reserved: f64,
    /// `capacity - allocated - reserved`.
    pub available: f64,
    /// `(allocated + reserved) / capacity`.
    pub utilization: f64,
    /// Number of tasks currently holding an allocation.
    pub holders: usize,
    /// Rolling metrics.
    pub metrics: PoolMetrics,
}

#[derive(Debug)]
struct PoolState {
    capacity: f64,
    allocated: f64,
    reserved: f64,
    allocations: HashMap<TaskId, f64>,
    metrics: PoolMetrics,
}

impl PoolState {
    fn available(&self) -> f64 {
        (self.capacity - self.allocated - self.reserved).max(0.0)
    }

    fn recompute_allocated(&mut self) {
        self.allocated = self.allocations.values().sum();
    }
}

/// Bookkeeping for one resource dimension.
#[derive(Debug)]
pub struct ResourcePool {
    kind: ResourceKind,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    /// Create a pool.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if `capacity` is not a positive
    /// finite number.
    pub fn new(kind: ResourceKind, capacity: f64) -> Result<Self, SchedulerError> {
        validate_capacity(&kind, capacity)?;
        Ok(Self {
            kind,
            state: Mutex::new(PoolState {
                capacity,
                allocated: 0.0,
                reserved: 0.0,
                allocations: HashMap::new(),
                metrics: PoolMetrics::default(),
            }),
        })
    }

    /// Resource dimension of this pool.
    #[must_use]
    pub const fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity
    }

    /// Sum of live allocations.
    #[must_use]
    pub fn allocated(&self) -> f64 {
        self.state.lock().allocated
    }

    /// Capacity held by reservations.
    #[must_use]
    pub fn reserved(&self) -> f64 {
        self.state.lock().reserved
    }

    /// Capacity not allocated and not reserved.
    #[must_use]
    pub fn available(&self) -> f64 {
        self.state.lock().available()
    }

    /// Whether `amount` could be granted in full right now.
    #[must_use]
    pub fn can_allocate(&self, amount: f64) -> bool {
        amount <= self.state.lock().available() + EPSILON
    }

    /// Amount currently allocated to `task_id`, 0 if none.
    #[must_use]
    pub fn allocation_of(&self, task_id: &TaskId) -> f64 {
        self.state
            .lock()
            .allocations
            .get(task_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Grant `min(amount, available())` to `task_id` and return the granted
    /// amount. Never blocks. A zero grant records nothing. Repeated grants to
    /// the same task accumulate.
    pub fn allocate(&self, task_id: TaskId, amount: f64) -> f64 {
        let mut state = self.state.lock();
        let granted = amount.max(0.0).min(state.available());
        if granted <= EPSILON {
            return 0.0;
        }
        *state.allocations.entry(task_id).or_insert(0.0) += granted;
        state.recompute_allocated();
        let allocated = state.allocated;
        state.metrics.sample(allocated);
        drop(state);
        tracing::trace!(kind = %self.kind, %task_id, granted, "allocated");
        granted
    }

    /// Release everything held by `task_id` and return the released amount.
    /// Releasing an untracked id returns 0.
    pub fn release(&self, task_id: &TaskId) -> f64 {
        let mut state = self.state.lock();
        let Some(released) = state.allocations.remove(task_id) else {
            return 0.0;
        };
        state.recompute_allocated();
        let allocated = state.allocated;
        state.metrics.sample(allocated);
        drop(state);
        tracing::trace!(kind = %self.kind, %task_id, released, "released");
        released
    }

    /// Hold up to `amount` of capacity outside the allocation path and return
    /// the amount actually reserved.
    pub fn reserve(&self, amount: f64) -> f64 {
        let mut state = self.state.lock();
        let granted = amount.max(0.0).min(state.available());
        state.reserved += granted;
        granted
    }

    /// Give back up to `amount` of reserved capacity and return the amount
    /// actually released.
    pub fn release_reservation(&self, amount: f64) -> f64 {
        let mut state = self.state.lock();
        let released = amount.max(0.0).min(state.reserved);
        state.reserved -= released;
        if state.reserved < EPSILON {
            state.reserved = 0.0;
        }
        released
    }

    /// Change the pool capacity.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for non-positive or non-finite
    /// values and `SchedulerError::CapacityBelowCommitted` if the new capacity
    /// is smaller than `allocated + reserved`.
    pub fn set_capacity(&self, capacity: f64) -> Result<(), SchedulerError> {
        validate_capacity(&self.kind, capacity)?;
        let mut state = self.state.lock();
        let committed = state.allocated + state.reserved;
        if capacity + EPSILON < committed {
            return Err(SchedulerError::CapacityBelowCommitted {
                kind: self.kind.clone(),
                requested: capacity,
                committed,
            });
        }
        state.capacity = capacity;
        Ok(())
    }

    /// Point-in-time view of this pool.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            kind: self.kind.clone(),
            capacity: state.capacity,
            allocated: state.allocated,
            reserved: state.reserved,
            available: state.available(),
            utilization: (state.allocated + state.reserved) / state.capacity,
            holders: state.allocations.len(),
            metrics: state.metrics,
        }
    }
}

fn validate_capacity(kind: &ResourceKind, capacity: f64) -> Result<(), SchedulerError> {
    if !capacity.is_finite() || capacity <= 0.0 {
        return Err(SchedulerError::InvalidConfig(format!(
            "capacity for `{kind}` must be a positive finite number, got {capacity}"
        )));
    }
    Ok(())
}
