//! The resource cache manager.
//!
//! Owns every live record, hands out [`RecordHandle`]s, and enforces the
//! memory budget by evicting the least recently touched settled records.
//! It never does I/O itself: work for the data thread and the render thread
//! is handed over through queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use mapstream_cache::{ByteBuffer, Gauges, MapStatistics, MemoryBudget, MemoryPressure};
use tracing::debug;

use crate::resource::{Footprint, RecordCell};
use crate::{
    AvailabilityTest, GpuHandle, PreparedPayload, RecordHandle, ResourceKey, ResourceKind,
    ResourceState,
};

/// A record and the generation a stage was queued for.
pub(crate) struct StageTicket {
    pub(crate) cell: Arc<RecordCell>,
    pub(crate) generation: u64,
}

/// CPU payloads of an evicted record, dropped on the data thread.
pub(crate) struct ReleasedBody {
    pub(crate) key: ResourceKey,
    pub(crate) raw: Option<ByteBuffer>,
    pub(crate) prepared: Option<PreparedPayload>,
}

struct Queue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    fn push(&self, item: T) {
        // Both ends live in the same struct, so the channel cannot disconnect
        let _ = self.sender.send(item);
    }

    fn pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Outcome of one [`ResourceCacheManager::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Footprint of all live records before eviction
    pub memory_before: usize,
    /// Footprint after eviction
    pub memory_after: usize,
    pub evicted: usize,
    /// Budget pressure after eviction. `Critical` means held records alone
    /// exceed the budget.
    pub pressure: MemoryPressure,
}

pub struct ResourceCacheManager {
    records: Mutex<HashMap<ResourceKey, Arc<RecordCell>>>,
    access_tick: AtomicU64,
    budget: MemoryBudget,
    stats: Arc<MapStatistics>,

    /// New or restarted records, for the data thread
    to_start: Queue<StageTicket>,
    /// Prepared GPU payloads, for the render thread
    to_upload: Queue<StageTicket>,
    /// Payloads of evicted records, for the data thread
    released_bodies: Queue<ReleasedBody>,
    /// GPU objects of evicted records, for the render thread
    released_gpu: Queue<GpuHandle>,

    disk_purge_requested: AtomicBool,
}

impl ResourceCacheManager {
    pub fn new(memory_budget: usize) -> Self {
        Self::with_statistics(memory_budget, Arc::new(MapStatistics::new()))
    }

    pub fn with_statistics(memory_budget: usize, stats: Arc<MapStatistics>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            access_tick: AtomicU64::new(0),
            budget: MemoryBudget::new(memory_budget),
            stats,
            to_start: Queue::new(),
            to_upload: Queue::new(),
            released_bodies: Queue::new(),
            released_gpu: Queue::new(),
            disk_purge_requested: AtomicBool::new(false),
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<ResourceKey, Arc<RecordCell>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_tick(&self) -> u64 {
        self.access_tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get or create the record for `key`.
    ///
    /// A new record starts in `Initializing` and is queued for the data
    /// thread. Requesting a record that ended in an error restarts it.
    /// The first request for a key fixes its kind.
    pub fn acquire(&self, key: impl Into<ResourceKey>, kind: ResourceKind) -> RecordHandle {
        self.acquire_inner(key.into(), kind, None)
    }

    /// Like [`acquire`](Self::acquire), with an availability test applied
    /// to the download.
    pub fn acquire_with_test(
        &self,
        key: impl Into<ResourceKey>,
        kind: ResourceKind,
        test: AvailabilityTest,
    ) -> RecordHandle {
        self.acquire_inner(key.into(), kind, Some(test))
    }

    fn acquire_inner(
        &self,
        key: ResourceKey,
        kind: ResourceKind,
        availability: Option<AvailabilityTest>,
    ) -> RecordHandle {
        let tick = self.next_tick();
        let mut records = self.lock_records();

        let (cell, created) = match records.get(&key) {
            Some(cell) => (cell.clone(), false),
            None => {
                let cell = Arc::new(RecordCell::new(key.clone(), kind, availability));
                records.insert(key, cell.clone());
                (cell, true)
            }
        };
        // Claim and restart happen under the map lock so eviction cannot race them
        let handle = RecordHandle::new(cell.clone());
        cell.touch(tick);
        let restarted = if created {
            None
        } else {
            let mut record = cell.lock();
            if record.state.is_error() {
                let generation = record.restart();
                cell.publish_footprint(&record);
                Some(generation)
            } else {
                None
            }
        };
        drop(records);

        if created {
            debug!(key = %cell.key, kind = %cell.kind, "resource created");
            self.to_start.push(StageTicket { cell, generation: 0 });
        } else if let Some(generation) = restarted {
            debug!(key = %cell.key, generation, "resource restarted after error");
            self.to_start.push(StageTicket { cell, generation });
        }

        handle
    }

    /// Give up a claim. Eviction, if any, happens on a later tick.
    pub fn release(&self, handle: RecordHandle) {
        drop(handle);
    }

    /// Mark a held resource as used again.
    pub fn touch(&self, handle: &RecordHandle) {
        handle.cell().touch(self.next_tick());
    }

    /// Current state of `key` without claiming it.
    pub fn state_of(&self, key: &str) -> Option<ResourceState> {
        let cell = self.lock_records().get(key).cloned();
        cell.map(|cell| cell.state())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock_records().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock_records().keys().cloned().collect()
    }

    pub fn memory_budget(&self) -> usize {
        self.budget.limit()
    }

    /// Takes effect on the next tick.
    pub fn set_memory_budget(&self, bytes: usize) {
        self.budget.set_limit(bytes);
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Footprint of all live records as of the last tick.
    pub fn total_memory_use(&self) -> usize {
        self.budget.current_usage()
    }

    /// Bytes left under the budget as of the last tick.
    pub fn memory_available(&self) -> usize {
        self.budget.available()
    }

    pub fn memory_pressure(&self) -> MemoryPressure {
        self.budget.pressure()
    }

    pub fn statistics(&self) -> &Arc<MapStatistics> {
        &self.stats
    }

    /// Recompute memory use and evict down to the budget.
    ///
    /// Candidates are settled records nobody holds, taken in ascending
    /// access order; eviction stops as soon as the total fits.
    pub fn tick(&self) -> TickReport {
        let cells: Vec<Arc<RecordCell>> = self.lock_records().values().cloned().collect();

        let mut gauges = Gauges::default();
        let mut total = Footprint::default();
        let mut candidates = Vec::new();
        for cell in cells {
            let state = cell.state();
            let footprint = cell.footprint();
            gauges.resources += 1;
            match state {
                ResourceState::Downloading => gauges.downloads += 1,
                ResourceState::Downloaded | ResourceState::Preparing => gauges.preparing += 1,
                _ => {}
            }
            total.ram += footprint.ram;
            total.gpu += footprint.gpu;
            if state.is_evictable() && cell.ref_count() == 0 {
                candidates.push(cell);
            }
        }

        let mut report = TickReport {
            memory_before: total.total(),
            ..TickReport::default()
        };

        if self.budget.is_exceeded_by(total.total()) {
            candidates.sort_by_key(|cell| cell.last_access_tick());
            for cell in candidates {
                if !self.budget.is_exceeded_by(total.total()) {
                    break;
                }
                if let Some(freed) = self.evict(&cell, false) {
                    total.ram = total.ram.saturating_sub(freed.ram);
                    total.gpu = total.gpu.saturating_sub(freed.gpu);
                    gauges.resources -= 1;
                    report.evicted += 1;
                }
            }
            debug!(
                evicted = report.evicted,
                before = report.memory_before,
                after = total.total(),
                budget = self.budget.limit(),
                "memory budget enforced"
            );
        }

        report.memory_after = total.total();
        self.budget.set_usage(report.memory_after);
        report.pressure = self.budget.pressure();
        gauges.ram_memory = total.ram as u64;
        gauges.gpu_memory = total.gpu as u64;
        self.stats.set_gauges(gauges);
        report
    }

    /// Evict every record, held or not, and clear the disk cache.
    pub fn purge(&self) -> usize {
        let evicted = self.purge_view_cache();
        self.purge_disk_cache();
        evicted
    }

    /// Evict every record, held or not. The disk cache is kept.
    pub fn purge_view_cache(&self) -> usize {
        let cells: Vec<Arc<RecordCell>> = self.lock_records().values().cloned().collect();
        let evicted = cells
            .iter()
            .filter(|cell| self.evict(cell, true).is_some())
            .count();
        self.budget.set_usage(0);
        self.stats.set_gauges(Gauges::default());
        debug!(evicted, "view cache purged");
        evicted
    }

    /// Ask the data thread to clear the disk cache on its next tick.
    pub fn purge_disk_cache(&self) {
        self.disk_purge_requested.store(true, Ordering::Release);
    }

    /// Moves a record to `Finalizing`, detaches it from the map and queues
    /// its payloads for release. `force` ignores liveness and state.
    fn evict(&self, cell: &Arc<RecordCell>, force: bool) -> Option<Footprint> {
        let mut records = self.lock_records();
        match records.get(&cell.key) {
            Some(current) if Arc::ptr_eq(current, cell) => {}
            _ => return None,
        }
        if !force && cell.ref_count() > 0 {
            return None;
        }

        let mut record = cell.lock();
        if !force && !record.state.is_evictable() {
            return None;
        }
        records.remove(&cell.key);
        drop(records);

        let freed = cell.footprint();
        record.state = ResourceState::Finalizing;
        if let Some(fetch) = record.fetch.take() {
            fetch.cancel();
        }
        if let Some(gpu) = record.gpu.take() {
            self.released_gpu.push(gpu);
        }
        let body = ReleasedBody {
            key: cell.key.clone(),
            raw: record.raw.take(),
            prepared: record.prepared.take(),
        };
        cell.publish_footprint(&record);
        drop(record);

        debug!(key = %cell.key, bytes = freed.total(), "resource evicted");
        self.released_bodies.push(body);
        Some(freed)
    }

    pub(crate) fn next_to_start(&self) -> Option<StageTicket> {
        self.to_start.pop()
    }

    pub(crate) fn queue_upload(&self, ticket: StageTicket) {
        self.to_upload.push(ticket);
    }

    pub(crate) fn next_to_upload(&self) -> Option<StageTicket> {
        self.to_upload.pop()
    }

    pub(crate) fn next_released_body(&self) -> Option<ReleasedBody> {
        self.released_bodies.pop()
    }

    pub(crate) fn next_released_gpu(&self) -> Option<GpuHandle> {
        self.released_gpu.pop()
    }

    pub(crate) fn take_disk_purge_request(&self) -> bool {
        self.disk_purge_requested.swap(false, Ordering::AcqRel)
    }

    /// Uploads waiting for the render thread.
    pub fn pending_uploads(&self) -> usize {
        self.to_upload.len()
    }
}
