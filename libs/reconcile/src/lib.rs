//! Reconciliation loop primitives for the warm pool.
//!
//! This library provides helpers for the loop that keeps the idle pool at
//! its target size. Key concepts:
//!
//! - **Target**: how many idle instances the current generation should have.
//! - **Inventory**: what the platform actually lists right now.
//! - **Deficit**: the gap between the two, bounded per pass by a batch size.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inventory
//! - A pass never launches more than `batch_size` jobs
//! - Only instances of the current generation count toward the target

use std::time::Duration;

mod task_group;

pub use task_group::{FailurePolicy, GroupOutcome, ParsePolicyError, TaskGroup};

/// Desired pool shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTarget {
    /// Idle instances the current generation should keep ready.
    pub desired_idle: u32,

    /// Maximum provisioning jobs launched in one pass.
    pub batch_size: u32,
}

impl Default for PoolTarget {
    fn default() -> Self {
        Self {
            desired_idle: DEFAULT_POOL_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl PoolTarget {
    /// Missing idle instances, ignoring the batch bound.
    pub fn deficit(&self, idle_current: usize) -> u32 {
        let idle = u32::try_from(idle_current).unwrap_or(u32::MAX);
        self.desired_idle.saturating_sub(idle)
    }

    /// Number of provisioning jobs to launch in this pass.
    ///
    /// Zero when the pool is full or over target.
    pub fn launch_count(&self, idle_current: usize) -> u32 {
        self.deficit(idle_current).min(self.batch_size)
    }
}

/// Split items into those of the current generation and the rest.
///
/// Order within each side follows the input order.
pub fn classify_by_version<I, V, F>(items: I, current: &V, get_version: F) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    V: PartialEq + ?Sized,
    F: Fn(&I::Item) -> &V,
{
    let mut matching = Vec::new();
    let mut old = Vec::new();

    for item in items {
        if get_version(&item) == current {
            matching.push(item);
        } else {
            old.push(item);
        }
    }

    (matching, old)
}

/// Default reconciliation interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default idle pool size.
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Default number of concurrent provisioning jobs per pass.
pub const DEFAULT_BATCH_SIZE: u32 = 2;
