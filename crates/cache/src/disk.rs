//! Persistent disk cache for raw resource bytes with validation metadata and LRU eviction.
//!
//! Entries are keyed by the resource key string. Each entry is one file named
//! by a stable hash of its key, written atomically (temp file + rename) so a
//! crash mid-write never leaves a half-written entry behind. The file starts
//! with a small header carrying the full key, payload size and checksum, and
//! the HTTP validators (ETag, expiry) the fetch returned.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::buffer::{AllocError, ByteBuffer};

const ENTRY_MAGIC: &[u8; 4] = b"MSRC";
const ENTRY_EXTENSION: &str = "res";
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Errors from the disk cache. Callers treat all of them as a cache miss.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("disk cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("disk cache entry for '{key}' failed validation: {reason}")]
    Validation { key: String, reason: String },
    #[error("disk cache metadata error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Validity metadata stored alongside the cached bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Opaque validator from the origin, used for conditional revalidation
    pub etag: Option<String>,
    /// Unix time (seconds) after which the entry is stale; `None` never expires
    pub expires_at: Option<u64>,
}

impl EntryMetadata {
    pub fn is_stale_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// A cache entry read back from disk.
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub bytes: ByteBuffer,
    pub metadata: EntryMetadata,
    /// True when the entry expired; the bytes may still be reused after revalidation
    pub stale: bool,
}

/// Statistics for monitoring disk cache behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries evicted to stay within the disk limit
    pub evictions: u64,
    /// Entries dropped because they were corrupt or explicitly invalidated
    pub invalidations: u64,
    pub entry_count: usize,
    /// Total bytes on disk, headers included
    pub disk_used: usize,
}

impl DiskCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    size: u64,
    checksum: u64,
    etag: Option<String>,
    expires_at: Option<u64>,
    stored_at: u64,
}

struct CacheState {
    /// Key hash -> file size on disk
    entries: HashMap<u64, usize>,
    /// front = least recently used
    lru_queue: VecDeque<u64>,
    stats: DiskCacheStats,
    disk_limit: usize,
    cache_dir: PathBuf,
}

impl CacheState {
    fn touch(&mut self, hash: u64) {
        self.lru_queue.retain(|&h| h != hash);
        self.lru_queue.push_back(hash);
    }

    fn entry_path(&self, hash: u64) -> PathBuf {
        self.cache_dir.join(format!("{:016x}.{}", hash, ENTRY_EXTENSION))
    }

    /// Forget an entry and delete its file. Missing files are fine.
    fn drop_entry(&mut self, hash: u64) -> io::Result<()> {
        self.lru_queue.retain(|&h| h != hash);
        if let Some(size) = self.entries.remove(&hash) {
            self.stats.disk_used = self.stats.disk_used.saturating_sub(size);
            self.stats.entry_count = self.entries.len();
        }
        match fs::remove_file(self.entry_path(hash)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn evict_lru(&mut self) -> io::Result<()> {
        if let Some(hash) = self.lru_queue.front().copied() {
            self.drop_entry(hash)?;
            self.stats.evictions += 1;
        }
        Ok(())
    }

    fn evict_until_space_available(&mut self, needed_space: usize) -> io::Result<()> {
        while self.stats.disk_used + needed_space > self.disk_limit && !self.lru_queue.is_empty() {
            self.evict_lru()?;
        }
        Ok(())
    }
}

/// Persistent disk cache for raw resource bytes.
///
/// Cloning shares the same underlying store.
#[derive(Clone)]
pub struct DiskCache {
    state: Arc<Mutex<CacheState>>,
}

impl DiskCache {
    /// Open (or create) a cache directory and index the entries already in it.
    pub fn open<P: AsRef<Path>>(cache_dir: P, disk_limit: usize) -> Result<Self, DiskError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;

        let cache = Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                stats: DiskCacheStats::default(),
                disk_limit,
                cache_dir,
            })),
        };
        cache.load_from_disk()?;
        Ok(cache)
    }

    pub fn with_mb_limit<P: AsRef<Path>>(cache_dir: P, megabytes: usize) -> Result<Self, DiskError> {
        Self::open(cache_dir, megabytes * 1024 * 1024)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existence check only; does not read the file or touch LRU order.
    pub fn available(&self, key: &str) -> bool {
        self.lock().entries.contains_key(&key_hash(key))
    }

    /// Read an entry.
    ///
    /// Returns `Ok(None)` on a miss. A corrupt entry is deleted and reported
    /// as [`DiskError::Validation`].
    pub fn read(&self, key: &str) -> Result<Option<DiskEntry>, DiskError> {
        let hash = key_hash(key);
        let mut state = self.lock();

        if !state.entries.contains_key(&hash) {
            state.stats.misses += 1;
            return Ok(None);
        }

        let path = state.entry_path(hash);
        let (header, bytes) = match read_entry_file(&path, key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                // Hash collision with another key: leave that entry alone.
                state.stats.misses += 1;
                return Ok(None);
            }
            Err(err) => {
                state.stats.misses += 1;
                state.stats.invalidations += 1;
                if let Err(remove_err) = state.drop_entry(hash) {
                    warn!("failed to remove corrupt disk cache entry {}: {}", key, remove_err);
                }
                return Err(err);
            }
        };

        state.touch(hash);
        state.stats.hits += 1;

        let metadata = EntryMetadata {
            etag: header.etag,
            expires_at: header.expires_at,
        };
        let stale = metadata.is_stale_at(unix_now());
        Ok(Some(DiskEntry {
            bytes,
            metadata,
            stale,
        }))
    }

    /// Store bytes for a key, replacing any previous entry.
    ///
    /// Evicts least recently used entries to stay within the disk limit.
    pub fn write(&self, key: &str, bytes: &[u8], metadata: &EntryMetadata) -> Result<(), DiskError> {
        let hash = key_hash(key);
        let header = EntryHeader {
            key: key.to_string(),
            size: bytes.len() as u64,
            checksum: payload_checksum(bytes),
            etag: metadata.etag.clone(),
            expires_at: metadata.expires_at,
            stored_at: unix_now(),
        };
        let header_bytes = serde_json::to_vec(&header)?;
        let file_size = ENTRY_MAGIC.len() + 4 + header_bytes.len() + bytes.len();

        let mut state = self.lock();
        let mut file = NamedTempFile::new_in(&state.cache_dir)?;
        file.write_all(ENTRY_MAGIC)?;
        file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;

        // The previous entry stays indexed until the new file replaces it
        let old_size = state.entries.get(&hash).copied();
        state.lru_queue.retain(|&h| h != hash);
        let needed = file_size.saturating_sub(old_size.unwrap_or(0));
        let stored = match state.evict_until_space_available(needed) {
            Ok(()) => file.persist(state.entry_path(hash)).map(drop).map_err(|e| e.error),
            Err(err) => Err(err),
        };
        if let Err(err) = stored {
            if old_size.is_some() {
                state.lru_queue.push_back(hash);
            }
            return Err(err.into());
        }

        if let Some(old_size) = old_size {
            state.stats.disk_used = state.stats.disk_used.saturating_sub(old_size);
        }
        state.entries.insert(hash, file_size);
        state.lru_queue.push_back(hash);
        state.stats.disk_used += file_size;
        state.stats.entry_count = state.entries.len();

        debug!("disk cache stored {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    /// Remove an entry so future lookups miss.
    pub fn invalidate(&self, key: &str) -> Result<(), DiskError> {
        let hash = key_hash(key);
        let mut state = self.lock();
        if state.entries.contains_key(&hash) {
            state.drop_entry(hash)?;
            state.stats.invalidations += 1;
        }
        Ok(())
    }

    /// Delete every entry in the cache directory.
    pub fn purge(&self) -> Result<(), DiskError> {
        let mut state = self.lock();
        let hashes: Vec<u64> = state.entries.keys().copied().collect();
        for hash in hashes {
            if let Err(e) = state.drop_entry(hash) {
                warn!("failed to remove disk cache entry {:016x}: {}", hash, e);
            }
        }
        state.entries.clear();
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;
        Ok(())
    }

    pub fn stats(&self) -> DiskCacheStats {
        self.lock().stats.clone()
    }

    pub fn disk_limit(&self) -> usize {
        self.lock().disk_limit
    }

    pub fn disk_used(&self) -> usize {
        self.lock().stats.disk_used
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.lock().cache_dir.clone()
    }

    /// Update the disk limit, evicting entries if now over it.
    pub fn set_disk_limit(&self, new_limit: usize) -> Result<(), DiskError> {
        let mut state = self.lock();
        state.disk_limit = new_limit;
        state.evict_until_space_available(0)?;
        Ok(())
    }

    /// Rebuild the index by scanning the cache directory.
    ///
    /// Leftover temp files from an interrupted write are removed.
    pub fn load_from_disk(&self) -> Result<(), DiskError> {
        let mut state = self.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;

        let mut found = Vec::new();
        for entry in fs::read_dir(&state.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXTENSION) {
                if is_temp_file(&path) {
                    fs::remove_file(&path).ok();
                }
                continue;
            }

            let Some(hash) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| u64::from_str_radix(stem, 16).ok())
            else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            found.push((modified, hash, metadata.len() as usize));
        }

        // Oldest files become the first eviction candidates.
        found.sort();
        for (_, hash, size) in found {
            state.entries.insert(hash, size);
            state.lru_queue.push_back(hash);
            state.stats.disk_used += size;
        }
        state.stats.entry_count = state.entries.len();

        debug!(
            "disk cache indexed {} entries ({} bytes)",
            state.stats.entry_count, state.stats.disk_used
        );
        Ok(())
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn key_hash(key: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x6d61_7073_7472_6561, 0x6d2d_6b65_792d_6861);
    hasher.write(key.as_bytes());
    hasher.finish()
}

fn payload_checksum(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x6d61_7073_7472_6561, 0x7061_796c_6f61_6473);
    hasher.write(bytes);
    hasher.finish()
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| name.starts_with(".tmp"))
}

/// Read and validate one entry file. `Ok(None)` means the file belongs to another key.
fn read_entry_file(path: &Path, key: &str) -> Result<Option<(EntryHeader, ByteBuffer)>, DiskError> {
    let invalid = |reason: &str| DiskError::Validation {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(|_| invalid("truncated magic"))?;
    if &magic != ENTRY_MAGIC {
        return Err(invalid("bad magic"));
    }

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes).map_err(|_| invalid("truncated header length"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(invalid("header too large"));
    }

    let mut header_bytes = vec![0u8; header_len];
    file.read_exact(&mut header_bytes).map_err(|_| invalid("truncated header"))?;
    let header: EntryHeader = serde_json::from_slice(&header_bytes)?;
    if header.key != key {
        return Ok(None);
    }

    let payload_len = file
        .metadata()?
        .len()
        .saturating_sub((ENTRY_MAGIC.len() + 4 + header_len) as u64);
    if header.size != payload_len {
        return Err(invalid("recorded size does not match file"));
    }

    let mut bytes = ByteBuffer::allocate(header.size as usize)?;
    file.read_exact(&mut bytes).map_err(|_| invalid("truncated payload"))?;
    if payload_checksum(&bytes) != header.checksum {
        return Err(invalid("checksum mismatch"));
    }

    Ok(Some((header, bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_cache() -> (DiskCache, PathBuf) {
        let cache_dir = std::env::temp_dir().join(format!("mapstream-test-{}", rand::random::<u32>()));
        let cache = DiskCache::with_mb_limit(&cache_dir, 1).unwrap();
        (cache, cache_dir)
    }

    fn cleanup_test_cache(cache_dir: PathBuf) {
        fs::remove_dir_all(cache_dir).ok();
    }

    fn fresh() -> EntryMetadata {
        EntryMetadata::default()
    }

    #[test]
    fn test_basic_write_read() {
        let (cache, cache_dir) = create_test_cache();

        let bytes = vec![42u8; 4096];
        let meta = EntryMetadata {
            etag: Some("\"abc\"".into()),
            expires_at: None,
        };
        cache.write("tile/0/0.jpg", &bytes, &meta).unwrap();

        let entry = cache.read("tile/0/0.jpg").unwrap().unwrap();
        assert_eq!(entry.bytes.as_slice(), bytes.as_slice());
        assert_eq!(entry.metadata, meta);
        assert!(!entry.stale);

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_miss_counts() {
        let (cache, cache_dir) = create_test_cache();

        assert!(cache.read("missing").unwrap().is_none());
        assert!(!cache.available("missing"));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_expired_entry_is_stale() {
        let (cache, cache_dir) = create_test_cache();

        let meta = EntryMetadata {
            etag: None,
            expires_at: Some(1),
        };
        cache.write("old", b"bytes", &meta).unwrap();

        let entry = cache.read("old").unwrap().unwrap();
        assert!(entry.stale);
        assert_eq!(entry.bytes.as_slice(), b"bytes");

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_corrupt_entry_is_invalidated() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("tile", &[1u8; 128], &fresh()).unwrap();
        let path = cache_dir.join(format!("{:016x}.{}", key_hash("tile"), ENTRY_EXTENSION));

        // Flip the last payload byte.
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();

        let err = cache.read("tile").unwrap_err();
        assert!(matches!(err, DiskError::Validation { .. }));
        assert!(!cache.available("tile"));
        assert!(!path.exists());
        assert_eq!(cache.stats().invalidations, 1);

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_truncated_entry_is_invalidated() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("tile", &[1u8; 128], &fresh()).unwrap();
        let path = cache_dir.join(format!("{:016x}.{}", key_hash("tile"), ENTRY_EXTENSION));
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 10]).unwrap();

        assert!(matches!(cache.read("tile"), Err(DiskError::Validation { .. })));

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_oversized_header_size_is_rejected_before_allocation() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("tile", &[1u8; 16], &fresh()).unwrap();
        let path = cache_dir.join(format!("{:016x}.{}", key_hash("tile"), ENTRY_EXTENSION));

        let header = EntryHeader {
            key: "tile".to_string(),
            size: u64::MAX / 2,
            checksum: 0,
            etag: None,
            expires_at: None,
            stored_at: 0,
        };
        let header_bytes = serde_json::to_vec(&header).unwrap();
        let mut raw = ENTRY_MAGIC.to_vec();
        raw.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        raw.extend_from_slice(&header_bytes);
        raw.extend_from_slice(&[1u8; 16]);
        fs::write(&path, raw).unwrap();

        let err = cache.read("tile").unwrap_err();
        assert!(matches!(err, DiskError::Validation { .. }));
        assert!(!cache.available("tile"));

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_failed_overwrite_keeps_previous_entry_indexed() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("a", &[1u8; 64], &fresh()).unwrap();
        let used = cache.disk_used();

        // A directory in place of the entry file makes the rename fail
        let path = cache_dir.join(format!("{:016x}.{}", key_hash("a"), ENTRY_EXTENSION));
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), b"x").unwrap();

        assert!(cache.write("a", &[2u8; 32], &fresh()).is_err());
        assert!(cache.available("a"));
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.disk_used(), used);

        fs::remove_dir_all(&path).unwrap();
        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_lru_eviction() {
        let (cache, cache_dir) = create_test_cache();

        let bytes = vec![255u8; 300 * 1024];
        cache.write("a", &bytes, &fresh()).unwrap();
        cache.write("b", &bytes, &fresh()).unwrap();
        cache.write("c", &bytes, &fresh()).unwrap();

        // Touch "a" so "b" becomes the oldest.
        cache.read("a").unwrap();
        cache.write("d", &bytes, &fresh()).unwrap();

        assert!(cache.available("a"));
        assert!(!cache.available("b"));
        assert!(cache.available("c"));
        assert!(cache.available("d"));
        assert!(cache.stats().evictions > 0);

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_invalidate_and_purge() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("a", b"1", &fresh()).unwrap();
        cache.write("b", b"2", &fresh()).unwrap();

        cache.invalidate("a").unwrap();
        assert!(!cache.available("a"));
        assert_eq!(cache.entry_count(), 1);

        cache.purge().unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.disk_used(), 0);
        assert!(cache.read("b").unwrap().is_none());

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_overwrite_existing_entry() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("a", &[1u8; 10], &fresh()).unwrap();
        cache.write("a", &[2u8; 20], &fresh()).unwrap();

        let entry = cache.read("a").unwrap().unwrap();
        assert_eq!(entry.bytes.as_slice(), &[2u8; 20]);
        assert_eq!(cache.entry_count(), 1);

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_reopen_restores_index() {
        let (cache, cache_dir) = create_test_cache();

        cache.write("a", b"alpha", &fresh()).unwrap();
        cache.write("b", b"beta", &fresh()).unwrap();
        let used = cache.disk_used();
        drop(cache);

        // Stray temp file from an interrupted write.
        fs::write(cache_dir.join(".tmpXYZ"), b"partial").unwrap();

        let reopened = DiskCache::with_mb_limit(&cache_dir, 1).unwrap();
        assert_eq!(reopened.entry_count(), 2);
        assert_eq!(reopened.disk_used(), used);
        assert_eq!(reopened.read("b").unwrap().unwrap().bytes.as_slice(), b"beta");
        assert!(!cache_dir.join(".tmpXYZ").exists());

        cleanup_test_cache(cache_dir);
    }

    #[test]
    fn test_set_disk_limit() {
        let (cache, cache_dir) = create_test_cache();

        let bytes = vec![0u8; 100 * 1024];
        cache.write("a", &bytes, &fresh()).unwrap();
        cache.write("b", &bytes, &fresh()).unwrap();

        cache.set_disk_limit(150 * 1024).unwrap();
        assert_eq!(cache.entry_count(), 1);
        assert!(cache.available("b"));

        cleanup_test_cache(cache_dir);
    }
}
