//! Memory budget tracking for resident resources.
//!
//! The budget is a single byte ceiling for RAM + GPU memory held by live
//! resources. The cache manager publishes the measured usage once per tick
//! and evicts while [`MemoryBudget::is_exceeded_by`] holds for the running
//! total. The limit can be changed at runtime from any thread.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Memory pressure level indicating cache health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    /// < 50% utilization
    #[default]
    Low,
    /// 50-75% utilization
    Moderate,
    /// 75-100% utilization
    High,
    /// Over budget
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization <= 1.0 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Byte ceiling plus the last measured usage.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: AtomicUsize,
    current_usage: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            current_usage: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Change the ceiling; takes effect on the next manager tick.
    pub fn set_limit(&self, bytes: usize) {
        self.limit.store(bytes, Ordering::Relaxed);
    }

    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    pub fn set_usage(&self, bytes: usize) {
        self.current_usage.store(bytes, Ordering::Relaxed);
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.current_usage())
    }

    /// Whether `usage` bytes would be over the ceiling.
    pub fn is_exceeded_by(&self, usage: usize) -> bool {
        usage > self.limit()
    }

    pub fn utilization(&self) -> f64 {
        let limit = self.limit();
        if limit == 0 {
            if self.current_usage() == 0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            self.current_usage() as f64 / limit as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }
}
