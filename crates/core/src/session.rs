//! A map session: the cache manager plus the data-thread and render-thread
//! steps that move records through their lifecycle.
//!
//! [`MapResources`] implements [`DataSession`], so it is attached to a
//! [`DataThread`](mapstream_scheduler::DataThread) which calls
//! `data_tick` in a loop. The renderer calls [`MapResources::render_tick`]
//! once per frame with its [`GpuUploader`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mapstream_cache::{
    unix_now, ByteBuffer, CacheConfig, Counter, DiskCache, DiskEntry, EntryMetadata,
};
use mapstream_scheduler::{DataSession, FetchError, FetchReply, FetchResult, FetchTask, Fetcher};
use tracing::{debug, info, warn};

use crate::manager::StageTicket;
use crate::{
    AvailabilityTest, GpuUploader, PrepareError, RecordHandle, ResourceCacheManager,
    ResourceDecoder, ResourceError, ResourceKey, ResourceKind, ResourceState, TickReport,
};

/// Configuration for a [`MapResources`] session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cache: CacheConfig,
    /// Records decoded per data tick. Default: 16.
    pub max_prepare_per_tick: usize,
    /// GPU uploads per rendered frame. Default: 8.
    pub max_uploads_per_frame: usize,
    /// Sent with every fetch, e.g. authentication
    pub fetch_headers: Vec<(String, String)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            max_prepare_per_tick: 16,
            max_uploads_per_frame: 8,
            fetch_headers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn new(cache: CacheConfig) -> Self {
        Self {
            cache,
            ..Self::default()
        }
    }

    pub fn with_max_prepare_per_tick(mut self, count: usize) -> Self {
        self.max_prepare_per_tick = count;
        self
    }

    pub fn with_max_uploads_per_frame(mut self, count: usize) -> Self {
        self.max_uploads_per_frame = count;
        self
    }

    pub fn with_fetch_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fetch_headers.push((name.into(), value.into()));
        self
    }
}

/// Outcome of one [`MapResources::render_tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTickReport {
    pub cache: TickReport,
    pub uploaded: usize,
    pub upload_failures: usize,
    pub destroyed: usize,
}

/// A fetch the data thread is waiting on.
struct InFlight {
    ticket: StageTicket,
    /// Stale disk bytes being revalidated with `If-None-Match`
    stale: Option<DiskEntry>,
}

/// State only the data thread touches.
#[derive(Default)]
struct DataState {
    fetcher: Option<Arc<dyn Fetcher>>,
    disk: Option<DiskCache>,
    in_flight: Vec<InFlight>,
    downloaded: VecDeque<StageTicket>,
}

/// Keys under this scheme are only ever served from registered memory.
pub const INTERNAL_SCHEME: &str = "internal://";

/// One map's resources.
pub struct MapResources {
    manager: Arc<ResourceCacheManager>,
    decoder: Arc<dyn ResourceDecoder>,
    config: SessionConfig,
    data: Mutex<DataState>,
    /// Published by the data thread so readers never wait on its lock
    in_flight: AtomicUsize,
    /// Embedded bytes served ahead of the disk cache and the network
    internal: Mutex<HashMap<ResourceKey, ByteBuffer>>,
}

impl MapResources {
    pub fn new(config: SessionConfig, decoder: Arc<dyn ResourceDecoder>) -> Self {
        let manager = Arc::new(ResourceCacheManager::new(config.cache.memory_budget));
        Self {
            manager,
            decoder,
            config,
            data: Mutex::new(DataState::default()),
            in_flight: AtomicUsize::new(0),
            internal: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<ResourceCacheManager> {
        &self.manager
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn acquire(&self, key: impl Into<ResourceKey>, kind: ResourceKind) -> RecordHandle {
        self.manager.acquire(key, kind)
    }

    pub fn acquire_with_test(
        &self,
        key: impl Into<ResourceKey>,
        kind: ResourceKind,
        test: AvailabilityTest,
    ) -> RecordHandle {
        self.manager.acquire_with_test(key, kind, test)
    }

    pub fn release(&self, handle: RecordHandle) {
        self.manager.release(handle);
    }

    pub fn touch(&self, handle: &RecordHandle) {
        self.manager.touch(handle);
    }

    /// Fetches the data thread is waiting on.
    /// Serve `key` from memory. Takes effect for records started after this
    /// call; a record already loaded keeps its bytes until evicted.
    pub fn register_internal(&self, key: impl Into<ResourceKey>, bytes: impl Into<ByteBuffer>) {
        let key = key.into();
        debug!(key = %key, "internal resource registered");
        self.internal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, bytes.into());
    }

    pub fn unregister_internal(&self, key: &str) -> bool {
        self.internal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    fn internal_bytes(&self, key: &str) -> Option<ByteBuffer> {
        self.internal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Fetches the data thread is waiting on, as of its last tick.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn lock_data(&self) -> MutexGuard<'_, DataState> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, counter: Counter) {
        self.manager.statistics().increment(counter);
    }

    // ------------------------------------------------------------------
    // Render thread
    // ------------------------------------------------------------------

    /// Per-frame render-thread step: enforce the budget, destroy GPU objects
    /// of evicted records, then upload prepared payloads.
    pub fn render_tick(&self, gpu: &mut dyn GpuUploader) -> RenderTickReport {
        let mut report = RenderTickReport {
            cache: self.manager.tick(),
            ..RenderTickReport::default()
        };

        while let Some(handle) = self.manager.next_released_gpu() {
            gpu.destroy(handle);
            report.destroyed += 1;
        }

        while report.uploaded + report.upload_failures < self.config.max_uploads_per_frame {
            let Some(ticket) = self.manager.next_to_upload() else {
                break;
            };
            match self.upload(gpu, &ticket) {
                Some(true) => report.uploaded += 1,
                Some(false) => report.upload_failures += 1,
                None => {}
            }
        }

        self.count(Counter::RenderTicks);
        report
    }

    /// `None` when the record moved on before its upload slot came up.
    fn upload(&self, gpu: &mut dyn GpuUploader, ticket: &StageTicket) -> Option<bool> {
        let cell = &ticket.cell;
        let payload = cell
            .commit(ticket.generation, ResourceState::Preparing, |record| {
                record.prepared.take()
            })
            .flatten()?;

        match gpu.upload(&cell.key, payload) {
            Ok(handle) => {
                let mut handle = Some(handle);
                let committed = cell
                    .commit(ticket.generation, ResourceState::Preparing, |record| {
                        record.gpu = handle.take();
                        record.state = ResourceState::Ready;
                    })
                    .is_some();
                if let Some(orphan) = handle {
                    gpu.destroy(orphan);
                }
                if !committed {
                    return None;
                }
                debug!(key = %cell.key, "resource ready on gpu");
                Some(true)
            }
            Err(err) => {
                info!(key = %cell.key, error = %err, "gpu upload failed");
                let committed = cell
                    .commit(ticket.generation, ResourceState::Preparing, |record| {
                        record.state = ResourceState::ErrorPrepare;
                        record.error = Some(ResourceError::Prepare(err));
                    })
                    .is_some();
                if committed {
                    self.count(Counter::ResourcesFailed);
                }
                Some(false)
            }
        }
    }

    /// Destroys every GPU object the session still owns. Call on the render
    /// thread when the map goes away.
    pub fn render_finalize(&self, gpu: &mut dyn GpuUploader) {
        self.manager.purge_view_cache();
        let mut destroyed = 0usize;
        while let Some(handle) = self.manager.next_released_gpu() {
            gpu.destroy(handle);
            destroyed += 1;
        }
        while self.manager.next_to_upload().is_some() {}
        debug!(destroyed, "render side finalized");
    }

    // ------------------------------------------------------------------
    // Data thread
    // ------------------------------------------------------------------

    fn drop_released_bodies(&self) -> bool {
        let mut released = 0u64;
        while let Some(body) = self.manager.next_released_body() {
            let bytes = body.raw.as_ref().map_or(0, ByteBuffer::memory_size)
                + body.prepared.as_ref().map_or(0, |payload| payload.footprint());
            debug!(key = %body.key, bytes, "resource released");
            drop(body);
            released += 1;
        }
        self.manager
            .statistics()
            .add(Counter::ResourcesReleased, released);
        released > 0
    }

    fn service_disk_purge(&self, data: &DataState) -> bool {
        if !self.manager.take_disk_purge_request() {
            return false;
        }
        if let Some(disk) = &data.disk {
            match disk.purge() {
                Ok(()) => info!(dir = %disk.cache_dir().display(), "disk cache purged"),
                Err(err) => warn!(error = %err, "disk cache purge failed"),
            }
        }
        true
    }

    fn start_pending(&self, data: &mut DataState) -> bool {
        let mut started = false;
        while let Some(ticket) = self.manager.next_to_start() {
            started = true;
            if !ticket
                .cell
                .is_at(ticket.generation, ResourceState::Initializing)
            {
                continue;
            }
            self.start(data, ticket);
        }
        started
    }

    fn start(&self, data: &mut DataState, ticket: StageTicket) {
        let cell = ticket.cell.clone();
        let key = cell.key.as_str();

        if let Some(bytes) = self.internal_bytes(key) {
            let committed = cell.commit(ticket.generation, ResourceState::Initializing, |record| {
                record.raw = Some(bytes);
                record.raw_from_disk = false;
                record.state = ResourceState::Downloaded;
            });
            if committed.is_some() {
                debug!(key, "resource loaded from internal memory");
                self.count(Counter::ResourcesDiskLoaded);
                data.downloaded.push_back(ticket);
            }
            return;
        }
        if key.starts_with(INTERNAL_SCHEME) {
            self.fail(
                &ticket,
                ResourceState::Initializing,
                ResourceError::Download(FetchError::HttpStatus(404)),
            );
            return;
        }

        let entry = data.disk.as_ref().and_then(|disk| match disk.read(key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "disk cache read failed");
                None
            }
        });

        let stale = match entry {
            Some(entry) if !entry.stale => {
                let committed = cell.commit(ticket.generation, ResourceState::Initializing, |record| {
                    record.raw = Some(entry.bytes);
                    record.raw_from_disk = true;
                    record.state = ResourceState::Downloaded;
                });
                if committed.is_some() {
                    debug!(key, "resource loaded from disk cache");
                    self.count(Counter::ResourcesDiskLoaded);
                    data.downloaded.push_back(ticket);
                }
                return;
            }
            Some(entry) if entry.metadata.etag.is_some() => Some(entry),
            _ => None,
        };

        let mut task = FetchTask::new(key);
        for (name, value) in &self.config.fetch_headers {
            task = task.with_header(name.clone(), value.clone());
        }
        if let Some(etag) = stale.as_ref().and_then(|entry| entry.metadata.etag.as_deref()) {
            task = task.with_header("If-None-Match", etag);
        }

        let Some(fetcher) = data.fetcher.clone() else {
            self.fail(
                &ticket,
                ResourceState::Initializing,
                ResourceError::Download(FetchError::Network("no fetcher attached".to_string())),
            );
            return;
        };
        let mut handle = Some(fetcher.submit(task));
        let committed = cell
            .commit(ticket.generation, ResourceState::Initializing, |record| {
                record.fetch = handle.take();
                record.state = ResourceState::Downloading;
            })
            .is_some();
        // An uncommitted handle is dropped here, which cancels it
        drop(handle);

        if committed {
            debug!(key, revalidate = stale.is_some(), "resource download started");
            data.in_flight.push(InFlight { ticket, stale });
        }
    }

    fn poll_fetches(&self, data: &mut DataState) -> bool {
        let mut progressed = false;
        for flight in std::mem::take(&mut data.in_flight) {
            let cell = &flight.ticket.cell;
            let polled = {
                let mut record = cell.lock();
                if !record.is_at(flight.ticket.generation, ResourceState::Downloading) {
                    // Evicted or restarted meanwhile
                    progressed = true;
                    continue;
                }
                match record.fetch.as_mut() {
                    Some(handle) => handle.poll(),
                    None => Some(Err(FetchError::Cancelled)),
                }
            };
            match polled {
                Some(result) => {
                    progressed = true;
                    self.finish_fetch(data, flight, result);
                }
                None => data.in_flight.push(flight),
            }
        }
        progressed
    }

    fn finish_fetch(&self, data: &mut DataState, flight: InFlight, result: FetchResult) {
        let InFlight { ticket, stale } = flight;
        let cell = ticket.cell.clone();
        let key = cell.key.as_str();

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                let reason = cell
                    .availability
                    .as_ref()
                    .and_then(|test| test.check_error(&err));
                let error = match reason {
                    Some(reason) => ResourceError::Unavailable(reason),
                    None => ResourceError::Download(err),
                };
                self.fail(&ticket, ResourceState::Downloading, error);
                return;
            }
        };

        if let Some(reason) = cell
            .availability
            .as_ref()
            .and_then(|test| test.check_reply(&reply))
        {
            self.fail(&ticket, ResourceState::Downloading, ResourceError::Unavailable(reason));
            return;
        }

        if reply.is_not_modified() {
            let Some(entry) = stale else {
                self.fail(
                    &ticket,
                    ResourceState::Downloading,
                    ResourceError::Download(FetchError::HttpStatus(304)),
                );
                return;
            };
            let metadata = EntryMetadata {
                etag: reply.etag.or(entry.metadata.etag),
                // Without a new max-age the entry stays due for revalidation
                expires_at: reply.expires_at.or_else(|| Some(unix_now())),
            };
            self.persist(data, key, &entry.bytes, &metadata);
            if self.commit_downloaded(data, ticket, entry.bytes, true) {
                debug!(key, "disk cache entry revalidated");
                self.count(Counter::ResourcesDiskLoaded);
            }
            return;
        }

        let FetchReply {
            bytes,
            etag,
            expires_at,
            ..
        } = reply;
        self.persist(data, key, &bytes, &EntryMetadata { etag, expires_at });
        if self.commit_downloaded(data, ticket, bytes, false) {
            debug!(key, "resource downloaded");
            self.count(Counter::ResourcesDownloaded);
        }
    }

    fn commit_downloaded(
        &self,
        data: &mut DataState,
        ticket: StageTicket,
        bytes: ByteBuffer,
        from_disk: bool,
    ) -> bool {
        let committed = ticket
            .cell
            .commit(ticket.generation, ResourceState::Downloading, |record| {
                record.fetch = None;
                record.raw = Some(bytes);
                record.raw_from_disk = from_disk;
                record.state = ResourceState::Downloaded;
            })
            .is_some();
        if committed {
            data.downloaded.push_back(ticket);
        }
        committed
    }

    /// Best-effort write; a failing disk never fails the resource.
    fn persist(&self, data: &DataState, key: &str, bytes: &[u8], metadata: &EntryMetadata) {
        if let Some(disk) = &data.disk {
            if let Err(err) = disk.write(key, bytes, metadata) {
                warn!(key, error = %err, "disk cache write failed");
            }
        }
    }

    fn fail(&self, ticket: &StageTicket, expected: ResourceState, error: ResourceError) {
        let state = match error {
            ResourceError::Prepare(_) => ResourceState::ErrorPrepare,
            _ => ResourceState::ErrorDownload,
        };
        let unavailable = error.is_unavailable();
        info!(key = %ticket.cell.key, error = %error, "resource failed");

        let committed = ticket
            .cell
            .commit(ticket.generation, expected, |record| {
                record.fetch = None;
                record.raw = None;
                record.raw_from_disk = false;
                record.prepared = None;
                record.state = state;
                record.error = Some(error);
            })
            .is_some();
        if committed {
            self.count(if unavailable {
                Counter::ResourcesIgnored
            } else {
                Counter::ResourcesFailed
            });
        }
    }

    fn prepare_downloaded(&self, data: &mut DataState) -> bool {
        let mut prepared = 0;
        while prepared < self.config.max_prepare_per_tick {
            let Some(ticket) = data.downloaded.pop_front() else {
                break;
            };
            prepared += 1;
            self.prepare(data, ticket);
        }
        prepared > 0
    }

    fn prepare(&self, data: &DataState, ticket: StageTicket) {
        let cell = ticket.cell.clone();
        let Some((raw, from_disk)) =
            cell.commit(ticket.generation, ResourceState::Downloaded, |record| {
                record.state = ResourceState::Preparing;
                (record.raw.take(), std::mem::take(&mut record.raw_from_disk))
            })
        else {
            return;
        };

        let decoded = match raw {
            Some(bytes) => self.decoder.decode(cell.kind, &cell.key, bytes),
            None => Err(PrepareError::CorruptPayload("no downloaded bytes".to_string())),
        };

        match decoded {
            Ok(payload) => {
                let needs_gpu = cell.kind.needs_gpu();
                let committed = cell
                    .commit(ticket.generation, ResourceState::Preparing, |record| {
                        record.prepared = Some(payload);
                        if !needs_gpu {
                            record.state = ResourceState::Ready;
                        }
                    })
                    .is_some();
                if !committed {
                    return;
                }
                self.count(Counter::ResourcesProcessLoaded);
                if needs_gpu {
                    debug!(key = %cell.key, "resource prepared, waiting for upload");
                    self.manager.queue_upload(ticket);
                } else {
                    debug!(key = %cell.key, "resource ready");
                }
            }
            Err(err) => {
                if from_disk {
                    if let Some(disk) = &data.disk {
                        if let Err(disk_err) = disk.invalidate(cell.key.as_str()) {
                            warn!(key = %cell.key, error = %disk_err, "disk cache invalidation failed");
                        }
                    }
                }
                self.fail(&ticket, ResourceState::Preparing, ResourceError::Prepare(err));
            }
        }
    }
}

impl DataSession for MapResources {
    fn data_initialize(&self, fetcher: Arc<dyn Fetcher>) {
        let cache = &self.config.cache;
        let disk = if cache.disk_cache_enabled {
            match DiskCache::open(&cache.disk_cache_dir, cache.disk_cache_size) {
                Ok(disk) => {
                    info!(
                        dir = %cache.disk_cache_dir.display(),
                        entries = disk.entry_count(),
                        "disk cache opened"
                    );
                    Some(disk)
                }
                Err(err) => {
                    warn!(dir = %cache.disk_cache_dir.display(), error = %err, "disk cache unavailable, using network only");
                    None
                }
            }
        } else {
            None
        };

        let mut data = self.lock_data();
        data.fetcher = Some(fetcher);
        data.disk = disk;
    }

    fn data_tick(&self) -> bool {
        let mut data = self.lock_data();
        let mut busy = self.drop_released_bodies();
        busy |= self.service_disk_purge(&data);
        busy |= self.start_pending(&mut data);
        busy |= self.poll_fetches(&mut data);
        self.in_flight.store(data.in_flight.len(), Ordering::Release);
        busy |= self.prepare_downloaded(&mut data);
        self.count(Counter::DataTicks);
        busy
    }

    fn data_finalize(&self) {
        let evicted = self.manager.purge_view_cache();
        self.drop_released_bodies();

        let mut data = self.lock_data();
        data.in_flight.clear();
        self.in_flight.store(0, Ordering::Release);
        data.downloaded.clear();
        data.fetcher = None;
        data.disk = None;
        info!(evicted, "data side finalized");
    }
}
