//! Resource records and the handles consumers hold on them.
//!
//! A record lives in a [`RecordCell`]: the mutable part (state, payloads,
//! pending fetch) behind a mutex that stages lock briefly and never across
//! I/O or decoding, and the hot counters (liveness, recency, footprint) as
//! atomics so the render thread can read them without locking.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mapstream_cache::ByteBuffer;
use mapstream_scheduler::FetchHandle;
use serde::Serialize;

use crate::{AvailabilityTest, GpuHandle, PreparedPayload, ResourceError, ResourceKind};

/// Canonical name of a resource, normally its URL. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Waiting for the data thread to look it up
    Initializing,
    Downloading,
    /// Raw bytes present, waiting to be decoded
    Downloaded,
    /// Being decoded, or decoded and waiting for GPU upload
    Preparing,
    Ready,
    ErrorDownload,
    ErrorPrepare,
    /// Evicted; payloads are being released
    Finalizing,
}

impl ResourceState {
    pub fn is_error(self) -> bool {
        matches!(self, ResourceState::ErrorDownload | ResourceState::ErrorPrepare)
    }

    /// Ready or failed: no stage will touch the record until it is
    /// requested again or evicted.
    pub fn is_settled(self) -> bool {
        self == ResourceState::Ready || self.is_error()
    }

    /// States eviction may take a record from.
    pub fn is_evictable(self) -> bool {
        self.is_settled()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Initializing => "initializing",
            ResourceState::Downloading => "downloading",
            ResourceState::Downloaded => "downloaded",
            ResourceState::Preparing => "preparing",
            ResourceState::Ready => "ready",
            ResourceState::ErrorDownload => "error_download",
            ResourceState::ErrorPrepare => "error_prepare",
            ResourceState::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory held by one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Footprint {
    pub ram: usize,
    pub gpu: usize,
}

impl Footprint {
    pub fn total(&self) -> usize {
        self.ram + self.gpu
    }
}

/// Mutable part of a record.
#[derive(Debug)]
pub(crate) struct ResourceRecord {
    pub(crate) state: ResourceState,
    /// Bumped on every restart; stage results from older generations are dropped
    pub(crate) generation: u64,
    pub(crate) raw: Option<ByteBuffer>,
    pub(crate) raw_from_disk: bool,
    pub(crate) prepared: Option<PreparedPayload>,
    pub(crate) gpu: Option<GpuHandle>,
    pub(crate) fetch: Option<FetchHandle>,
    pub(crate) error: Option<ResourceError>,
}

impl ResourceRecord {
    fn new() -> Self {
        Self {
            state: ResourceState::Initializing,
            generation: 0,
            raw: None,
            raw_from_disk: false,
            prepared: None,
            gpu: None,
            fetch: None,
            error: None,
        }
    }

    pub(crate) fn is_at(&self, generation: u64, state: ResourceState) -> bool {
        self.generation == generation && self.state == state
    }

    pub(crate) fn footprint(&self) -> Footprint {
        let raw = self.raw.as_ref().map_or(0, ByteBuffer::memory_size);
        let prepared = self.prepared.as_ref().map_or(0, PreparedPayload::footprint);
        let (gpu_ram, gpu) = self
            .gpu
            .as_ref()
            .map_or((0, 0), |handle| (handle.ram_memory(), handle.gpu_memory()));
        Footprint {
            ram: raw + prepared + gpu_ram,
            gpu,
        }
    }

    /// Back to `Initializing` with a fresh generation and no payloads.
    pub(crate) fn restart(&mut self) -> u64 {
        self.generation += 1;
        self.state = ResourceState::Initializing;
        self.raw = None;
        self.raw_from_disk = false;
        self.prepared = None;
        self.fetch = None;
        self.error = None;
        self.generation
    }
}

/// Shared shell around one record.
#[derive(Debug)]
pub(crate) struct RecordCell {
    pub(crate) key: ResourceKey,
    pub(crate) kind: ResourceKind,
    pub(crate) availability: Option<AvailabilityTest>,
    record: Mutex<ResourceRecord>,
    ref_count: AtomicU32,
    last_access_tick: AtomicU64,
    ram_footprint: AtomicUsize,
    gpu_footprint: AtomicUsize,
}

impl RecordCell {
    pub(crate) fn new(
        key: ResourceKey,
        kind: ResourceKind,
        availability: Option<AvailabilityTest>,
    ) -> Self {
        Self {
            key,
            kind,
            availability,
            record: Mutex::new(ResourceRecord::new()),
            ref_count: AtomicU32::new(0),
            last_access_tick: AtomicU64::new(0),
            ram_footprint: AtomicUsize::new(0),
            gpu_footprint: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ResourceRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ResourceState {
        self.lock().state
    }

    pub(crate) fn is_at(&self, generation: u64, state: ResourceState) -> bool {
        self.lock().is_at(generation, state)
    }

    /// Runs `update` if the record is still at `generation` and in
    /// `expected` state, then republishes the footprint.
    pub(crate) fn commit<R>(
        &self,
        generation: u64,
        expected: ResourceState,
        update: impl FnOnce(&mut ResourceRecord) -> R,
    ) -> Option<R> {
        let mut record = self.lock();
        if !record.is_at(generation, expected) {
            return None;
        }
        let result = update(&mut record);
        self.publish_footprint(&record);
        Some(result)
    }

    pub(crate) fn publish_footprint(&self, record: &ResourceRecord) {
        let footprint = record.footprint();
        self.ram_footprint.store(footprint.ram, Ordering::Release);
        self.gpu_footprint.store(footprint.gpu, Ordering::Release);
    }

    pub(crate) fn footprint(&self) -> Footprint {
        Footprint {
            ram: self.ram_footprint.load(Ordering::Acquire),
            gpu: self.gpu_footprint.load(Ordering::Acquire),
        }
    }

    pub(crate) fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Recency only moves forward.
    pub(crate) fn touch(&self, tick: u64) {
        self.last_access_tick.fetch_max(tick, Ordering::AcqRel);
    }

    pub(crate) fn last_access_tick(&self) -> u64 {
        self.last_access_tick.load(Ordering::Acquire)
    }
}

/// A consumer's claim on a resource.
///
/// While a handle exists the record is never evicted by the budget.
/// Dropping the handle releases the claim.
pub struct RecordHandle {
    cell: Arc<RecordCell>,
}

impl RecordHandle {
    pub(crate) fn new(cell: Arc<RecordCell>) -> Self {
        cell.retain();
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<RecordCell> {
        &self.cell
    }

    pub fn key(&self) -> &ResourceKey {
        &self.cell.key
    }

    pub fn kind(&self) -> ResourceKind {
        self.cell.kind
    }

    pub fn state(&self) -> ResourceState {
        self.cell.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ResourceState::Ready
    }

    pub fn generation(&self) -> u64 {
        self.cell.lock().generation
    }

    pub fn error(&self) -> Option<ResourceError> {
        self.cell.lock().error.clone()
    }

    pub fn last_access_tick(&self) -> u64 {
        self.cell.last_access_tick()
    }

    pub fn footprint(&self) -> Footprint {
        self.cell.footprint()
    }

    /// Number of live handles on this record, this one included.
    pub fn ref_count(&self) -> u32 {
        self.cell.ref_count()
    }

    /// Borrows the GPU object of a ready GPU resource.
    pub fn with_gpu_handle<R>(&self, f: impl FnOnce(&GpuHandle) -> R) -> Option<R> {
        let record = self.cell.lock();
        record.gpu.as_ref().map(f)
    }

    /// Borrows the prepared payload of a ready CPU-resident resource.
    pub fn with_payload<R>(&self, f: impl FnOnce(&PreparedPayload) -> R) -> Option<R> {
        let record = self.cell.lock();
        match record.state {
            ResourceState::Ready => record.prepared.as_ref().map(f),
            _ => None,
        }
    }
}

impl fmt::Debug for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordHandle")
            .field("key", &self.cell.key)
            .field("kind", &self.cell.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        self.cell.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell() -> RecordCell {
        RecordCell::new(ResourceKey::from("blob/1"), ResourceKind::Blob, None)
    }

    #[test]
    fn test_key_equality_is_byte_exact() {
        let a = ResourceKey::from("tile/0/0.jpg");
        let b = ResourceKey::from(String::from("tile/0/0.jpg"));
        let c = ResourceKey::from("tile/0/0.JPG");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "tile/0/0.jpg");
    }

    #[test]
    fn test_handle_refcount() {
        let cell = Arc::new(cell());
        let first = RecordHandle::new(cell.clone());
        let second = RecordHandle::new(cell.clone());
        assert_eq!(cell.ref_count(), 2);
        drop(first);
        assert_eq!(second.ref_count(), 1);
        drop(second);
        assert_eq!(cell.ref_count(), 0);
    }

    #[test]
    fn test_commit_checks_generation_and_state() {
        let cell = cell();
        assert_eq!(
            cell.commit(0, ResourceState::Initializing, |record| {
                record.state = ResourceState::Downloaded;
                record.raw = Some(ByteBuffer::from(vec![0u8; 10]));
            }),
            Some(())
        );
        assert_eq!(cell.footprint().ram, 10);

        // Wrong state
        assert!(cell.commit(0, ResourceState::Initializing, |_| ()).is_none());

        // Stale generation after a restart
        let generation = {
            let mut record = cell.lock();
            let generation = record.restart();
            cell.publish_footprint(&record);
            generation
        };
        assert_eq!(generation, 1);
        assert_eq!(cell.footprint(), Footprint::default());
        assert!(cell.commit(0, ResourceState::Initializing, |_| ()).is_none());
        assert!(cell.commit(1, ResourceState::Initializing, |_| ()).is_some());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let cell = cell();
        cell.touch(5);
        cell.touch(3);
        assert_eq!(cell.last_access_tick(), 5);
    }

    #[test]
    fn test_footprint_counts_every_payload() {
        let mut record = ResourceRecord::new();
        record.raw = Some(ByteBuffer::from(vec![0u8; 4]));
        record.prepared = Some(PreparedPayload::Blob(ByteBuffer::from(vec![0u8; 8])));
        record.gpu = Some(GpuHandle::new((), 100, 2));
        assert_eq!(record.footprint(), Footprint { ram: 14, gpu: 100 });
        assert_eq!(record.footprint().total(), 114);
    }

    #[test]
    fn test_state_classes() {
        assert!(ResourceState::Ready.is_evictable());
        assert!(ResourceState::ErrorPrepare.is_evictable());
        assert!(!ResourceState::Downloading.is_evictable());
        assert!(!ResourceState::Finalizing.is_settled());
        assert!(ResourceState::ErrorDownload.is_error());
    }
}
