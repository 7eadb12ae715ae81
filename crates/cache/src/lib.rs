//! Mapstream Cache Library
//!
//! Storage building blocks for map resources: the owned byte buffer that
//! moves raw bytes between stages, the persistent disk cache, the memory
//! budget, configuration, and statistics.

pub mod buffer;
pub mod config;
pub mod disk;
pub mod memory_budget;
pub mod statistics;

pub use buffer::{AllocError, ByteBuffer};
pub use config::{CacheConfig, ConfigError};
pub use disk::{unix_now, DiskCache, DiskCacheStats, DiskEntry, DiskError, EntryMetadata};
pub use memory_budget::{MemoryBudget, MemoryPressure};
pub use statistics::{Counter, Gauges, MapStatistics, StatisticsSnapshot, MAX_LODS};
