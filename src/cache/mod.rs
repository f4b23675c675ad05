//! Persistent, size-bounded store of reconstruction results.
//!
//! Results are grouped into one namespace per [`FieldIdentity`], so a field
//! swap drops everything computed from the old field in a single step.
//! Identical concurrent requests are computed once: later callers wait on a
//! per-fingerprint lock and pick up the stored result.

pub mod fingerprint;
mod lock_table;
mod store;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use web_time::{SystemTime, UNIX_EPOCH};

pub use fingerprint::{CACHE_FORMAT_VERSION, Fingerprint};

use crate::config::CacheConfig;
use crate::error::{CacheError, ReconstructionError};
use crate::reconstruction::{
    CancelToken, Engine, Reconstruct, ReconstructionRequest, ReconstructionResult,
};
use crate::volume::{FieldIdentity, Volume};
use lock_table::LockTable;
use store::{IndexRecord, NamespaceIndex};

const TRASH_PREFIX: &str = ".trash-";
/// Minimum spacing between age sweeps and index writes triggered by stores.
const MAINTENANCE_INTERVAL_MS: u64 = 5_000;

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Millisecond access stamps, strictly increasing within a process so LRU
/// order is total even when accesses share a millisecond.
#[derive(Debug)]
struct AccessClock(AtomicU64);

impl AccessClock {
    fn starting_after(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    fn stamp(&self) -> u64 {
        let now = wall_clock_ms();
        let prev = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }
}

struct Entry {
    bytes: u64,
    last_access: AtomicU64,
    /// Loaded lazily for entries found on disk at open.
    resident: Mutex<Option<Arc<ReconstructionResult>>>,
}

impl Entry {
    fn on_disk(record: IndexRecord) -> Self {
        Self {
            bytes: record.bytes,
            last_access: AtomicU64::new(record.last_access),
            resident: Mutex::new(None),
        }
    }

    fn resident(result: &Arc<ReconstructionResult>, stamp: u64) -> Self {
        Self {
            bytes: result.byte_size(),
            last_access: AtomicU64::new(stamp),
            resident: Mutex::new(Some(Arc::clone(result))),
        }
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn touch(&self, stamp: u64) {
        self.last_access.fetch_max(stamp, Ordering::Relaxed);
    }
}

struct Namespace {
    field: FieldIdentity,
    dir: PathBuf,
    entries: RwLock<HashMap<Fingerprint, Arc<Entry>>>,
    /// Set once invalidated. A detached namespace never touches the disk again.
    detached: AtomicBool,
    /// Index on disk is behind the in-memory state.
    dirty: AtomicBool,
}

impl Namespace {
    fn new(field: FieldIdentity, dir: PathBuf) -> Self {
        Self {
            field,
            dir,
            entries: RwLock::new(HashMap::new()),
            detached: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load a namespace directory, keeping only entries whose file is present
    /// with the expected size.
    fn load(dir: &Path) -> Result<Self, CacheError> {
        let index = store::read_index(dir)?;
        let field = FieldIdentity::new(index.field)
            .map_err(|e| CacheError::corrupt(dir, e.to_string()))?;
        if dir.file_name().and_then(|n| n.to_str()) != Some(field.namespace_key().as_str()) {
            return Err(CacheError::corrupt(dir, "directory does not match field identity"));
        }

        let namespace = Self::new(field, dir.to_path_buf());
        let mut entries = HashMap::with_capacity(index.entries.len());
        let mut missing = 0;
        for (key, record) in index.entries {
            let Ok(fingerprint) = key.parse::<Fingerprint>() else {
                missing += 1;
                continue;
            };
            let expected = store::entry_file_len(record.bytes);
            match fs::metadata(store::entry_path(dir, fingerprint)) {
                Ok(meta) if meta.len() == expected => {
                    entries.insert(fingerprint, Arc::new(Entry::on_disk(record)));
                }
                _ => missing += 1,
            }
        }
        let keep: HashSet<Fingerprint> = entries.keys().copied().collect();
        let orphans = store::sweep_orphans(dir, &keep);
        if missing > 0 || orphans > 0 {
            warn!(
                path = %dir.display(),
                missing,
                orphans,
                "Cache namespace out of sync with its index"
            );
            namespace.dirty.store(true, Ordering::Relaxed);
        }
        *namespace.entries.write() = entries;
        Ok(namespace)
    }

    fn snapshot(entries: &HashMap<Fingerprint, Arc<Entry>>, field: &str) -> NamespaceIndex {
        let mut index = NamespaceIndex::new(field);
        index.entries = entries
            .iter()
            .map(|(fingerprint, entry)| {
                (
                    fingerprint.to_string(),
                    IndexRecord {
                        bytes: entry.bytes,
                        last_access: entry.last_access(),
                    },
                )
            })
            .collect();
        index
    }

    /// Write the index if it is behind. Holds the read lock so an
    /// invalidation cannot slip in between the check and the write.
    fn save_index(&self) -> Result<(), CacheError> {
        let entries = self.entries.read();
        if self.detached.load(Ordering::Acquire) || !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let index = Self::snapshot(&entries, self.field.as_str());
        let written = fs::create_dir_all(&self.dir)
            .map_err(|e| CacheError::io(&self.dir, e))
            .and_then(|()| store::write_index(&self.dir, &index));
        if written.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        written
    }
}

struct Candidate {
    namespace: Arc<Namespace>,
    fingerprint: Fingerprint,
    last_access: u64,
}

fn remove_dir_logged(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "Failed to remove cache directory");
        }
    }
}

/// Remove sibling `v<N>` directories left by other cache format versions.
fn purge_other_versions(root: &Path, current: &Path) {
    let Ok(read_dir) = fs::read_dir(root) else {
        return;
    };
    for item in read_dir.flatten() {
        let path = item.path();
        let name = item.file_name();
        let is_version_dir = name.to_str().and_then(|n| n.strip_prefix('v')).is_some_and(|n| {
            !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())
        });
        if is_version_dir && path != current && path.is_dir() {
            info!(path = %path.display(), "Removing cache of another format version");
            remove_dir_logged(&path);
        }
    }
}

/// Load every namespace under `dir`, dropping trash and unreadable ones.
fn load_namespaces(dir: &Path) -> Vec<Namespace> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) => {
            warn!(path = %dir.display(), %err, "Cannot list cache directory");
            return Vec::new();
        }
    };
    let mut namespaces = Vec::new();
    for item in read_dir.flatten() {
        let path = item.path();
        if !path.is_dir() {
            continue;
        }
        if item.file_name().to_string_lossy().starts_with(TRASH_PREFIX) {
            remove_dir_logged(&path);
            continue;
        }
        match Namespace::load(&path) {
            Ok(namespace) => namespaces.push(namespace),
            Err(err) => {
                warn!(path = %path.display(), %err, "Dropping unreadable cache namespace");
                remove_dir_logged(&path);
            }
        }
    }
    namespaces
}

/// Fingerprint-addressed store in front of a [`Reconstruct`] implementation.
///
/// Entries persist under `<root>/v<CACHE_FORMAT_VERSION>/<namespace>/` and
/// survive restarts. Total pixel bytes stay under
/// [`CacheConfig::max_bytes`] by evicting least recently used entries, and
/// entries idle longer than [`CacheConfig::max_age`] are dropped on open and
/// by a periodic sweep. Stores write only their own entry file; namespace
/// indexes are rewritten by the same periodic pass, by [`Self::flush`] and on
/// drop.
///
/// Disk failures never fail a request: they are logged and the result is
/// recomputed or kept in memory only.
pub struct ReconstructionCache<E = Engine> {
    engine: E,
    config: CacheConfig,
    dir: PathBuf,
    namespaces: RwLock<HashMap<FieldIdentity, Arc<Namespace>>>,
    locks: LockTable<Fingerprint>,
    clock: AccessClock,
    total_bytes: AtomicU64,
    last_maintenance: AtomicU64,
}

impl<E: Reconstruct> ReconstructionCache<E> {
    /// Open (or create) the store at `config.root`.
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be created
    pub fn open(config: CacheConfig, engine: E) -> Result<Self, CacheError> {
        let dir = config.root.join(format!("v{CACHE_FORMAT_VERSION}"));
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        purge_other_versions(&config.root, &dir);

        let mut namespaces = HashMap::new();
        let mut newest = 0;
        let mut total = 0;
        for namespace in load_namespaces(&dir) {
            for entry in namespace.entries.read().values() {
                newest = newest.max(entry.last_access());
                total += entry.bytes;
            }
            namespaces.insert(namespace.field.clone(), Arc::new(namespace));
        }

        let cache = Self {
            engine,
            config,
            dir,
            namespaces: RwLock::new(namespaces),
            locks: LockTable::new(),
            clock: AccessClock::starting_after(newest),
            total_bytes: AtomicU64::new(total),
            last_maintenance: AtomicU64::new(wall_clock_ms()),
        };
        cache.evict_expired();
        cache.evict_to_budget();
        cache.flush_logged();
        info!(
            path = %cache.dir.display(),
            namespaces = cache.namespaces.read().len(),
            entries = cache.len(),
            total_bytes = cache.total_bytes(),
            "Opened reconstruction cache"
        );
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Return the stored result for `request`, computing and storing it on a
    /// miss.
    ///
    /// # Errors
    ///
    /// Returns the validation error before any lookup, or
    /// [`ReconstructionError::Cancelled`] if `cancel` fires while this caller
    /// computes. A cancelled computation stores nothing.
    pub fn get(
        &self,
        volume: &Volume,
        request: &ReconstructionRequest,
        cancel: &CancelToken,
    ) -> Result<Arc<ReconstructionResult>, ReconstructionError> {
        request.validate(volume)?;
        let fingerprint = request.fingerprint();
        if let Some(result) = self.lookup(request, fingerprint) {
            return Ok(result);
        }

        let _guard = self.locks.lock(&fingerprint);
        if let Some(result) = self.lookup(request, fingerprint) {
            debug!(%fingerprint, "Filled by a concurrent caller");
            return Ok(result);
        }
        if cancel.is_cancelled() {
            return Err(ReconstructionError::Cancelled);
        }

        debug!(%fingerprint, field = %request.field(), "Cache miss");
        let namespace = self.namespace_for(request.field());
        let result = Arc::new(self.engine.reconstruct(volume, request, cancel)?);
        self.insert(&namespace, fingerprint, &result);
        Ok(result)
    }

    /// Whether a result for `request` is stored, in memory or on disk.
    pub fn contains(&self, request: &ReconstructionRequest) -> bool {
        self.namespaces
            .read()
            .get(request.field())
            .is_some_and(|ns| ns.entries.read().contains_key(&request.fingerprint()))
    }

    pub fn len(&self) -> usize {
        self.namespaces
            .read()
            .values()
            .map(|ns| ns.entries.read().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pixel bytes held across all namespaces.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Drop every entry computed from `field`. Returns the number of entries
    /// dropped. Files are deleted in the background.
    pub fn invalidate(&self, field: &FieldIdentity) -> usize {
        let mut namespaces = self.namespaces.write();
        let Some(namespace) = namespaces.remove(field) else {
            return 0;
        };
        let mut entries = namespace.entries.write();
        namespace.detached.store(true, Ordering::Release);
        let dropped = entries.len();
        let bytes: u64 = entries.drain().map(|(_, e)| e.bytes).sum();
        self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);

        let trash = self.dir.join(format!(
            "{TRASH_PREFIX}{}-{}",
            field.namespace_key(),
            self.clock.stamp()
        ));
        match fs::rename(&namespace.dir, &trash) {
            Ok(()) => rayon::spawn(move || remove_dir_logged(&trash)),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %namespace.dir.display(), %err, "Cannot move namespace to trash");
                remove_dir_logged(&namespace.dir);
            }
        }
        drop(entries);
        drop(namespaces);

        info!(field = %field, entries = dropped, bytes, "Invalidated cache namespace");
        dropped
    }

    /// Write every index that is behind the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns the first write failure; the remaining indexes are still
    /// attempted.
    pub fn flush(&self) -> Result<(), CacheError> {
        let namespaces: Vec<Arc<Namespace>> = self.namespaces.read().values().cloned().collect();
        let mut first_error = None;
        for namespace in namespaces {
            if let Err(err) = namespace.save_index() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn flush_logged(&self) {
        if let Err(err) = self.flush() {
            warn!(%err, "Failed to write cache index");
        }
    }

    fn lookup(
        &self,
        request: &ReconstructionRequest,
        fingerprint: Fingerprint,
    ) -> Option<Arc<ReconstructionResult>> {
        let namespace = self.namespaces.read().get(request.field()).cloned()?;
        let entry = namespace.entries.read().get(&fingerprint).cloned()?;
        entry.touch(self.clock.stamp());
        namespace.dirty.store(true, Ordering::Relaxed);

        if let Some(result) = entry.resident.lock().clone() {
            debug!(%fingerprint, "Cache hit");
            return Some(result);
        }

        let expected = (request.output().width, request.output().height);
        match store::read_entry(&namespace.dir, fingerprint) {
            Ok(pixels) if pixels.dim() == expected => {
                let result = Arc::new(ReconstructionResult::new(request.clone(), pixels));
                *entry.resident.lock() = Some(Arc::clone(&result));
                debug!(%fingerprint, "Cache hit from disk");
                Some(result)
            }
            Ok(pixels) => {
                warn!(
                    %fingerprint,
                    found = ?pixels.dim(),
                    ?expected,
                    "Discarding cache entry with unexpected shape"
                );
                self.remove(&namespace, fingerprint);
                None
            }
            Err(err) => {
                warn!(%fingerprint, %err, "Discarding unreadable cache entry");
                self.remove(&namespace, fingerprint);
                None
            }
        }
    }

    fn namespace_for(&self, field: &FieldIdentity) -> Arc<Namespace> {
        if let Some(namespace) = self.namespaces.read().get(field) {
            return Arc::clone(namespace);
        }
        let mut namespaces = self.namespaces.write();
        let namespace = namespaces.entry(field.clone()).or_insert_with(|| {
            Arc::new(Namespace::new(
                field.clone(),
                self.dir.join(field.namespace_key()),
            ))
        });
        Arc::clone(namespace)
    }

    /// Store a freshly computed result. Must be called with the key lock for
    /// `fingerprint` held, so no other writer touches the same entry file.
    ///
    /// The file is written without any namespace lock. The entry is then
    /// recorded under a short write lock, or the file is deleted again if
    /// [`Self::invalidate`] detached the namespace in the meantime.
    fn insert(&self, namespace: &Namespace, fingerprint: Fingerprint, result: &Arc<ReconstructionResult>) {
        if namespace.detached.load(Ordering::Acquire) {
            debug!(%fingerprint, "Namespace invalidated during computation, not storing");
            return;
        }

        let written = fs::create_dir_all(&namespace.dir)
            .map_err(|e| CacheError::io(&namespace.dir, e))
            .and_then(|()| store::write_entry(&namespace.dir, fingerprint, result.pixels()));
        if let Err(err) = &written {
            warn!(%fingerprint, %err, "Cache entry kept in memory only");
        }

        let mut entries = namespace.entries.write();
        if namespace.detached.load(Ordering::Acquire) {
            drop(entries);
            if written.is_ok() {
                store::remove_entry(&namespace.dir, fingerprint);
            }
            debug!(%fingerprint, "Namespace invalidated during store, discarded");
            return;
        }
        let entry = Arc::new(Entry::resident(result, self.clock.stamp()));
        if let Some(old) = entries.insert(fingerprint, entry) {
            self.total_bytes.fetch_sub(old.bytes, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(result.byte_size(), Ordering::Relaxed);
        namespace.dirty.store(true, Ordering::Relaxed);
        drop(entries);

        debug!(
            %fingerprint,
            bytes = result.byte_size(),
            total_bytes = self.total_bytes(),
            "Stored reconstruction"
        );
        self.evict_to_budget();
        self.maintain();
    }

    /// Age sweep and index write, at most once per [`MAINTENANCE_INTERVAL_MS`].
    /// Entry files written since the last index write are swept as orphans
    /// if the process dies before the next one.
    fn maintain(&self) {
        let now = wall_clock_ms();
        let last = self.last_maintenance.load(Ordering::Relaxed);
        if now.saturating_sub(last) < MAINTENANCE_INTERVAL_MS
            || self
                .last_maintenance
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            return;
        }
        self.evict_expired();
        self.flush_logged();
    }

    fn remove(&self, namespace: &Namespace, fingerprint: Fingerprint) -> bool {
        let mut entries = namespace.entries.write();
        let Some(entry) = entries.remove(&fingerprint) else {
            return false;
        };
        self.total_bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
        if !namespace.detached.load(Ordering::Acquire) {
            store::remove_entry(&namespace.dir, fingerprint);
        }
        namespace.dirty.store(true, Ordering::Relaxed);
        true
    }

    fn candidates(&self) -> Vec<Candidate> {
        let namespaces = self.namespaces.read();
        let mut candidates = Vec::new();
        for namespace in namespaces.values() {
            for (fingerprint, entry) in namespace.entries.read().iter() {
                candidates.push(Candidate {
                    namespace: Arc::clone(namespace),
                    fingerprint: *fingerprint,
                    last_access: entry.last_access(),
                });
            }
        }
        candidates
    }

    fn evict_expired(&self) -> usize {
        let Some(max_age) = self.config.max_age else {
            return 0;
        };
        let cutoff = wall_clock_ms().saturating_sub(max_age.as_millis() as u64);
        let evicted = self
            .candidates()
            .into_iter()
            .filter(|c| c.last_access < cutoff)
            .filter(|c| self.remove(&c.namespace, c.fingerprint))
            .count();
        if evicted > 0 {
            debug!(evicted, "Evicted expired cache entries");
        }
        evicted
    }

    fn evict_to_budget(&self) -> usize {
        if self.total_bytes() <= self.config.max_bytes {
            return 0;
        }
        let mut candidates = self.candidates();
        candidates.sort_by_key(|c| c.last_access);
        let mut evicted = 0;
        for candidate in candidates {
            if self.total_bytes() <= self.config.max_bytes {
                break;
            }
            if self.remove(&candidate.namespace, candidate.fingerprint) {
                evicted += 1;
            }
        }
        debug!(
            evicted,
            total_bytes = self.total_bytes(),
            max_bytes = self.config.max_bytes,
            "Evicted least recently used cache entries"
        );
        evicted
    }
}

impl<E: Reconstruct + 'static> ReconstructionCache<E> {
    /// [`Self::get`] on the blocking pool, for async callers.
    pub async fn get_async(
        self: Arc<Self>,
        volume: Arc<Volume>,
        request: ReconstructionRequest,
        cancel: CancelToken,
    ) -> Result<Arc<ReconstructionResult>, ReconstructionError> {
        match tokio::task::spawn_blocking(move || self.get(&volume, &request, &cancel)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // Runtime shutting down.
            Err(_) => Err(ReconstructionError::Cancelled),
        }
    }
}

impl<E> Drop for ReconstructionCache<E> {
    fn drop(&mut self) {
        for namespace in self.namespaces.get_mut().values() {
            if let Err(err) = namespace.save_index() {
                warn!(%err, "Failed to write cache index on close");
            }
        }
    }
}
