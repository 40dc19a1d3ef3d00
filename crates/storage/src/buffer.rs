//! Buffer manager: a byte-accounted page cache over the data and temp
//! directories.
//!
//! Pages are sharded across `lru_num` independent LRU classes (class chosen
//! by key hash) so eviction bookkeeping doesn't contend on one lock. When
//! total cached bytes exceed the configured capacity, cold pages are
//! evicted from the class the insert landed in, then from the remaining
//! classes round-robin.
//!
//! When a persistence manager is attached, dirty pages are spilled to it on
//! `stop()` and cache misses read through it.

use crate::persistence::PersistenceManager;
use dashmap::{DashMap, DashSet};
use keel_core::{KeelError, KeelResult};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Identity of a cached page: owning file plus page number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file: String,
    pub page_no: u64,
}

impl PageKey {
    pub fn new(file: impl Into<String>, page_no: u64) -> Self {
        PageKey {
            file: file.into(),
            page_no,
        }
    }

    fn persistence_key(&self) -> String {
        format!("{}#{}", self.file, self.page_no)
    }
}

/// An immutable cached page.
#[derive(Debug)]
pub struct Page {
    pub data: Vec<u8>,
}

/// Page cache with LRU-class eviction.
pub struct BufferManager {
    capacity: u64,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    persistence: Option<Arc<PersistenceManager>>,
    pages: DashMap<PageKey, Arc<Page>>,
    dirty: DashSet<PageKey>,
    classes: Vec<Mutex<LruCache<PageKey, u64>>>,
    usage: AtomicU64,
    running: AtomicBool,
}

impl BufferManager {
    pub fn new(
        capacity: u64,
        data_dir: PathBuf,
        temp_dir: PathBuf,
        persistence: Option<Arc<PersistenceManager>>,
        lru_num: usize,
    ) -> Self {
        let lru_num = lru_num.max(1);
        let classes = (0..lru_num)
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();
        BufferManager {
            capacity,
            data_dir,
            temp_dir,
            persistence,
            pages: DashMap::new(),
            dirty: DashSet::new(),
            classes,
            usage: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Create the data and temp directories and begin serving.
    pub fn start(&self) -> KeelResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        info!(
            target: "keel::buffer",
            capacity = self.capacity,
            classes = self.classes.len(),
            "buffer manager started"
        );
        Ok(())
    }

    /// Spill dirty pages and drop the cache. Idempotent; safe without a
    /// prior `start()`.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(persistence) = &self.persistence {
            for key in self.dirty.iter().map(|k| k.key().clone()).collect::<Vec<_>>() {
                if let Some(page) = self.pages.get(&key) {
                    if let Err(e) = persistence.write(&key.persistence_key(), &page.data) {
                        warn!(
                            target: "keel::buffer",
                            file = %key.file,
                            page = key.page_no,
                            error = %e,
                            "failed to spill dirty page at stop"
                        );
                    }
                }
            }
        }
        self.dirty.clear();
        self.pages.clear();
        for class in &self.classes {
            class.lock().clear();
        }
        self.usage.store(0, Ordering::Release);
        info!(target: "keel::buffer", "buffer manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn class_of(&self, key: &PageKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.classes.len()
    }

    /// Insert a freshly written page and mark it dirty.
    pub fn allocate(&self, key: PageKey, data: Vec<u8>) -> Arc<Page> {
        let len = data.len() as u64;
        let page = Arc::new(Page { data });

        if let Some(old) = self.pages.insert(key.clone(), Arc::clone(&page)) {
            self.usage
                .fetch_sub(old.data.len() as u64, Ordering::AcqRel);
        }
        self.usage.fetch_add(len, Ordering::AcqRel);
        self.dirty.insert(key.clone());

        let class = self.class_of(&key);
        self.classes[class].lock().put(key, len);
        self.evict_if_over(class);
        page
    }

    /// Fetch a page, reading through the persistence manager on a miss.
    pub fn fetch(&self, key: &PageKey) -> KeelResult<Option<Arc<Page>>> {
        if let Some(page) = self.pages.get(key) {
            let class = self.class_of(key);
            self.classes[class].lock().get(key); // touch
            return Ok(Some(Arc::clone(page.value())));
        }

        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };
        let Some(addr) = persistence.addr_of(&key.persistence_key()) else {
            return Ok(None);
        };
        let data = persistence.read(&addr)?;
        let len = data.len() as u64;
        let page = Arc::new(Page { data });
        self.pages.insert(key.clone(), Arc::clone(&page));
        self.usage.fetch_add(len, Ordering::AcqRel);
        let class = self.class_of(key);
        self.classes[class].lock().put(key.clone(), len);
        self.evict_if_over(class);
        Ok(Some(page))
    }

    /// Read a whole file through the cache (one page per file).
    ///
    /// Catalog checkpoint loads go through here so file reads honor the
    /// buffer layer's accounting.
    pub fn read_file(&self, path: &Path) -> KeelResult<Vec<u8>> {
        let key = PageKey::new(path.display().to_string(), 0);
        if let Some(page) = self.pages.get(&key) {
            let class = self.class_of(&key);
            self.classes[class].lock().get(&key);
            return Ok(page.data.clone());
        }
        let data = std::fs::read(path).map_err(|e| {
            KeelError::storage(format!("failed to read '{}': {}", path.display(), e))
        })?;
        let len = data.len() as u64;
        self.pages.insert(key.clone(), Arc::new(Page { data: data.clone() }));
        self.usage.fetch_add(len, Ordering::AcqRel);
        let class = self.class_of(&key);
        self.classes[class].lock().put(key, len);
        self.evict_if_over(class);
        Ok(data)
    }

    /// Evict cold clean pages until usage is back under capacity.
    fn evict_if_over(&self, start_class: usize) {
        let class_count = self.classes.len();
        let mut class = start_class;
        let mut scanned = 0;
        while self.usage.load(Ordering::Acquire) > self.capacity && scanned < class_count * 2 {
            let evicted = {
                let mut lru = self.classes[class].lock();
                // Skip dirty pages; they are only reclaimed after a spill.
                let mut candidate = None;
                for _ in 0..lru.len() {
                    match lru.pop_lru() {
                        Some((key, len)) if self.dirty.contains(&key) => {
                            lru.put(key, len);
                        }
                        Some((key, len)) => {
                            candidate = Some((key, len));
                            break;
                        }
                        None => break,
                    }
                }
                candidate
            };
            match evicted {
                Some((key, len)) => {
                    self.pages.remove(&key);
                    self.usage.fetch_sub(len, Ordering::AcqRel);
                }
                None => {
                    class = (class + 1) % class_count;
                    scanned += 1;
                }
            }
        }
    }

    /// Persist a dirty page immediately and mark it clean.
    pub fn flush_page(&self, key: &PageKey) -> KeelResult<()> {
        let Some(persistence) = &self.persistence else {
            self.dirty.remove(key);
            return Ok(());
        };
        if let Some(page) = self.pages.get(key) {
            persistence.write(&key.persistence_key(), &page.data)?;
        }
        self.dirty.remove(key);
        Ok(())
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn buffer(root: &std::path::Path, capacity: u64) -> BufferManager {
        BufferManager::new(
            capacity,
            root.join("data"),
            root.join("tmp"),
            None,
            2,
        )
    }

    #[test]
    fn start_creates_directories() {
        let dir = TempDir::new().unwrap();
        let bm = buffer(dir.path(), 1024);
        bm.start().unwrap();
        assert!(dir.path().join("data").is_dir());
        assert!(dir.path().join("tmp").is_dir());
        bm.stop();
    }

    #[test]
    fn stop_without_start_is_safe() {
        let dir = TempDir::new().unwrap();
        let bm = buffer(dir.path(), 1024);
        bm.stop();
        bm.stop();
    }

    #[test]
    fn allocate_and_fetch() {
        let dir = TempDir::new().unwrap();
        let bm = buffer(dir.path(), 1024);
        bm.start().unwrap();

        let key = PageKey::new("t1.seg", 0);
        bm.allocate(key.clone(), vec![42u8; 64]);
        let page = bm.fetch(&key).unwrap().unwrap();
        assert_eq!(page.data, vec![42u8; 64]);
        assert_eq!(bm.usage(), 64);
        bm.stop();
    }

    #[test]
    fn eviction_keeps_usage_bounded() {
        let dir = TempDir::new().unwrap();
        let bm = buffer(dir.path(), 256);
        bm.start().unwrap();

        for i in 0..16 {
            let key = PageKey::new("big.seg", i);
            bm.allocate(key.clone(), vec![0u8; 64]);
            // Clean pages are the only eviction candidates.
            bm.flush_page(&key).unwrap();
        }
        assert!(
            bm.usage() <= 256,
            "usage {} exceeded capacity after eviction",
            bm.usage()
        );
        bm.stop();
    }

    #[test]
    fn miss_reads_through_persistence() {
        let dir = TempDir::new().unwrap();
        let pm = Arc::new(
            PersistenceManager::new(dir.path().join("persist"), dir.path().join("data"), 1 << 20)
                .unwrap(),
        );
        let bm = BufferManager::new(
            1024,
            dir.path().join("data"),
            dir.path().join("tmp"),
            Some(Arc::clone(&pm)),
            2,
        );
        bm.start().unwrap();

        let key = PageKey::new("spilled.seg", 3);
        bm.allocate(key.clone(), b"persisted bytes".to_vec());
        bm.stop(); // spills dirty pages

        let bm2 = BufferManager::new(
            1024,
            dir.path().join("data"),
            dir.path().join("tmp"),
            Some(pm),
            2,
        );
        bm2.start().unwrap();
        let page = bm2.fetch(&key).unwrap().unwrap();
        assert_eq!(page.data, b"persisted bytes");
        bm2.stop();
    }

    #[test]
    fn read_file_caches_contents() {
        let dir = TempDir::new().unwrap();
        let bm = buffer(dir.path(), 1 << 20);
        bm.start().unwrap();

        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"file contents").unwrap();

        let first = bm.read_file(&path).unwrap();
        assert_eq!(first, b"file contents");
        // Delete the backing file; cached read still succeeds.
        std::fs::remove_file(&path).unwrap();
        let second = bm.read_file(&path).unwrap();
        assert_eq!(second, b"file contents");
        bm.stop();
    }
}
