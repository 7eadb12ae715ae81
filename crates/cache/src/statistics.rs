//! Map resource statistics.
//!
//! Purely observational counters shared between the data thread and the
//! render thread. Accumulating counters only move forward until
//! [`MapStatistics::reset_all`]; per-frame counters are cleared by
//! [`MapStatistics::reset_frame`], which the renderer calls once per frame.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Number of levels of detail tracked by the per-LOD frame counters.
pub const MAX_LODS: usize = 22;

/// Accumulating counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Resources whose reply matched their availability test
    ResourcesIgnored,
    ResourcesDownloaded,
    ResourcesDiskLoaded,
    /// Resources decoded on the data thread
    ResourcesProcessLoaded,
    /// Resources evicted or purged and finalized
    ResourcesReleased,
    ResourcesFailed,
    DataTicks,
    RenderTicks,
}

/// Point-in-time gauges, recomputed by the cache manager each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gauges {
    pub resources: u64,
    pub downloads: u64,
    pub preparing: u64,
    pub gpu_memory: u64,
    pub ram_memory: u64,
}

#[derive(Debug)]
pub struct MapStatistics {
    meshes_rendered_total: AtomicU64,
    meshes_rendered_per_lod: [AtomicU64; MAX_LODS],
    meta_nodes_traversed_total: AtomicU64,
    meta_nodes_traversed_per_lod: [AtomicU64; MAX_LODS],

    resources_ignored: AtomicU64,
    resources_downloaded: AtomicU64,
    resources_disk_loaded: AtomicU64,
    resources_process_loaded: AtomicU64,
    resources_released: AtomicU64,
    resources_failed: AtomicU64,
    data_ticks: AtomicU64,
    render_ticks: AtomicU64,
    frame_index: AtomicU64,

    current_resources: AtomicU64,
    current_resource_downloads: AtomicU64,
    current_resource_preparing: AtomicU64,
    current_gpu_mem_use: AtomicU64,
    current_ram_mem_use: AtomicU64,
}

/// Serializable copy of every statistic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub meshes_rendered_total: u64,
    pub meshes_rendered_per_lod: Vec<u64>,
    pub meta_nodes_traversed_total: u64,
    pub meta_nodes_traversed_per_lod: Vec<u64>,

    pub resources_ignored: u64,
    pub resources_downloaded: u64,
    pub resources_disk_loaded: u64,
    pub resources_process_loaded: u64,
    pub resources_released: u64,
    pub resources_failed: u64,
    pub data_ticks: u64,
    pub render_ticks: u64,
    pub frame_index: u64,

    pub current_resources: u64,
    pub current_resource_downloads: u64,
    pub current_resource_preparing: u64,
    pub current_gpu_mem_use: u64,
    pub current_ram_mem_use: u64,
}

fn zeroed_lods() -> [AtomicU64; MAX_LODS] {
    std::array::from_fn(|_| AtomicU64::new(0))
}

fn load(value: &AtomicU64) -> u64 {
    value.load(Ordering::Relaxed)
}

impl MapStatistics {
    pub fn new() -> Self {
        Self {
            meshes_rendered_total: AtomicU64::new(0),
            meshes_rendered_per_lod: zeroed_lods(),
            meta_nodes_traversed_total: AtomicU64::new(0),
            meta_nodes_traversed_per_lod: zeroed_lods(),
            resources_ignored: AtomicU64::new(0),
            resources_downloaded: AtomicU64::new(0),
            resources_disk_loaded: AtomicU64::new(0),
            resources_process_loaded: AtomicU64::new(0),
            resources_released: AtomicU64::new(0),
            resources_failed: AtomicU64::new(0),
            data_ticks: AtomicU64::new(0),
            render_ticks: AtomicU64::new(0),
            frame_index: AtomicU64::new(0),
            current_resources: AtomicU64::new(0),
            current_resource_downloads: AtomicU64::new(0),
            current_resource_preparing: AtomicU64::new(0),
            current_gpu_mem_use: AtomicU64::new(0),
            current_ram_mem_use: AtomicU64::new(0),
        }
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::ResourcesIgnored => &self.resources_ignored,
            Counter::ResourcesDownloaded => &self.resources_downloaded,
            Counter::ResourcesDiskLoaded => &self.resources_disk_loaded,
            Counter::ResourcesProcessLoaded => &self.resources_process_loaded,
            Counter::ResourcesReleased => &self.resources_released,
            Counter::ResourcesFailed => &self.resources_failed,
            Counter::DataTicks => &self.data_ticks,
            Counter::RenderTicks => &self.render_ticks,
        }
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        self.counter(counter).fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        load(self.counter(counter))
    }

    /// Count a mesh drawn this frame. LODs past the table land in the last slot.
    pub fn record_mesh_rendered(&self, lod: usize) {
        self.meshes_rendered_total.fetch_add(1, Ordering::Relaxed);
        self.meshes_rendered_per_lod[lod.min(MAX_LODS - 1)].fetch_add(1, Ordering::Relaxed);
    }

    /// Count a meta node visited by traversal this frame.
    pub fn record_node_traversed(&self, lod: usize) {
        self.meta_nodes_traversed_total.fetch_add(1, Ordering::Relaxed);
        self.meta_nodes_traversed_per_lod[lod.min(MAX_LODS - 1)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gauges(&self, gauges: Gauges) {
        self.current_resources.store(gauges.resources, Ordering::Relaxed);
        self.current_resource_downloads.store(gauges.downloads, Ordering::Relaxed);
        self.current_resource_preparing.store(gauges.preparing, Ordering::Relaxed);
        self.current_gpu_mem_use.store(gauges.gpu_memory, Ordering::Relaxed);
        self.current_ram_mem_use.store(gauges.ram_memory, Ordering::Relaxed);
    }

    pub fn frame_index(&self) -> u64 {
        load(&self.frame_index)
    }

    /// Clear per-frame counters and advance the frame index.
    pub fn reset_frame(&self) {
        self.meshes_rendered_total.store(0, Ordering::Relaxed);
        self.meta_nodes_traversed_total.store(0, Ordering::Relaxed);
        for slot in self
            .meshes_rendered_per_lod
            .iter()
            .chain(self.meta_nodes_traversed_per_lod.iter())
        {
            slot.store(0, Ordering::Relaxed);
        }
        self.frame_index.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear everything, gauges included.
    pub fn reset_all(&self) {
        self.reset_frame();
        for counter in [
            &self.resources_ignored,
            &self.resources_downloaded,
            &self.resources_disk_loaded,
            &self.resources_process_loaded,
            &self.resources_released,
            &self.resources_failed,
            &self.data_ticks,
            &self.render_ticks,
            &self.frame_index,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.set_gauges(Gauges::default());
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            meshes_rendered_total: load(&self.meshes_rendered_total),
            meshes_rendered_per_lod: self.meshes_rendered_per_lod.iter().map(load).collect(),
            meta_nodes_traversed_total: load(&self.meta_nodes_traversed_total),
            meta_nodes_traversed_per_lod: self.meta_nodes_traversed_per_lod.iter().map(load).collect(),
            resources_ignored: load(&self.resources_ignored),
            resources_downloaded: load(&self.resources_downloaded),
            resources_disk_loaded: load(&self.resources_disk_loaded),
            resources_process_loaded: load(&self.resources_process_loaded),
            resources_released: load(&self.resources_released),
            resources_failed: load(&self.resources_failed),
            data_ticks: load(&self.data_ticks),
            render_ticks: load(&self.render_ticks),
            frame_index: load(&self.frame_index),
            current_resources: load(&self.current_resources),
            current_resource_downloads: load(&self.current_resource_downloads),
            current_resource_preparing: load(&self.current_resource_preparing),
            current_gpu_mem_use: load(&self.current_gpu_mem_use),
            current_ram_mem_use: load(&self.current_ram_mem_use),
        }
    }
}

impl Default for MapStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = MapStatistics::new();
        stats.increment(Counter::ResourcesDownloaded);
        stats.increment(Counter::ResourcesDownloaded);
        stats.add(Counter::ResourcesReleased, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.resources_downloaded, 2);
        assert_eq!(snap.resources_released, 3);
        assert_eq!(snap.resources_failed, 0);
    }

    #[test]
    fn test_reset_frame_keeps_global_counters() {
        let stats = MapStatistics::new();
        stats.increment(Counter::ResourcesFailed);
        stats.record_mesh_rendered(3);
        stats.record_node_traversed(40);
        stats.set_gauges(Gauges {
            resources: 5,
            ..Default::default()
        });

        stats.reset_frame();

        let snap = stats.snapshot();
        assert_eq!(snap.meshes_rendered_total, 0);
        assert_eq!(snap.meshes_rendered_per_lod[3], 0);
        assert_eq!(snap.meta_nodes_traversed_total, 0);
        assert_eq!(snap.resources_failed, 1);
        assert_eq!(snap.current_resources, 5);
        assert_eq!(snap.frame_index, 1);
    }

    #[test]
    fn test_lod_overflow_clamps() {
        let stats = MapStatistics::new();
        stats.record_node_traversed(100);
        let snap = stats.snapshot();
        assert_eq!(snap.meta_nodes_traversed_per_lod[MAX_LODS - 1], 1);
        assert_eq!(snap.meta_nodes_traversed_per_lod.len(), MAX_LODS);
    }

    #[test]
    fn test_reset_all() {
        let stats = MapStatistics::new();
        stats.increment(Counter::ResourcesDiskLoaded);
        stats.increment(Counter::RenderTicks);
        stats.record_mesh_rendered(0);
        stats.set_gauges(Gauges {
            resources: 2,
            downloads: 1,
            preparing: 1,
            gpu_memory: 10,
            ram_memory: 20,
        });

        stats.reset_all();
        assert_eq!(stats.snapshot(), MapStatistics::new().snapshot());
    }
}
