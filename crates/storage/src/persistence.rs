//! Local on-disk object store with size-bounded files.
//!
//! The persistence manager packs written buffers into append-only object
//! files under the persistence directory. When the current object file
//! exceeds the configured size limit, a new one is started. Each written
//! buffer is addressed by `(object, offset, len)`.
//!
//! The buffer manager holds the only handle to this for its lifetime; the
//! controller drops the buffer manager first on teardown.

use dashmap::DashMap;
use keel_core::{KeelError, KeelResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Address of a buffer inside an object file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAddr {
    pub object: String,
    pub offset: u64,
    pub len: u64,
}

struct PersistInner {
    current_object: u64,
    current_size: u64,
    file: Option<File>,
}

/// Size-bounded local object store.
pub struct PersistenceManager {
    persist_dir: PathBuf,
    #[allow(dead_code)]
    data_dir: PathBuf,
    object_size_limit: u64,
    inner: Mutex<PersistInner>,
    addr_map: DashMap<String, ObjectAddr>,
}

fn object_filename(number: u64) -> String {
    format!("obj_{:08}", number)
}

impl PersistenceManager {
    pub fn new(persist_dir: PathBuf, data_dir: PathBuf, object_size_limit: u64) -> KeelResult<Self> {
        std::fs::create_dir_all(&persist_dir)?;
        Ok(PersistenceManager {
            persist_dir,
            data_dir,
            object_size_limit,
            inner: Mutex::new(PersistInner {
                current_object: 0,
                current_size: 0,
                file: None,
            }),
            addr_map: DashMap::new(),
        })
    }

    /// Append a buffer, rotating to a new object file when the current one
    /// is over the size limit.
    pub fn write(&self, key: &str, bytes: &[u8]) -> KeelResult<ObjectAddr> {
        let mut inner = self.inner.lock();

        let needs_new = match inner.file {
            None => true,
            Some(_) => inner.current_size >= self.object_size_limit,
        };
        if needs_new {
            let next = inner.current_object + 1;
            let path = self.persist_dir.join(object_filename(next));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            inner.file = Some(file);
            inner.current_object = next;
            inner.current_size = 0;
        }

        let offset = inner.current_size;
        let object = object_filename(inner.current_object);
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| KeelError::internal("persistence object file missing after open"))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        inner.current_size += bytes.len() as u64;

        let addr = ObjectAddr {
            object,
            offset,
            len: bytes.len() as u64,
        };
        self.addr_map.insert(key.to_string(), addr.clone());
        Ok(addr)
    }

    /// Read a buffer back by address.
    pub fn read(&self, addr: &ObjectAddr) -> KeelResult<Vec<u8>> {
        let path = self.persist_dir.join(&addr.object);
        let mut file = File::open(&path).map_err(|e| {
            KeelError::storage(format!("persistence object '{}' unreadable: {}", addr.object, e))
        })?;
        file.seek(SeekFrom::Start(addr.offset))?;
        let mut buf = vec![0u8; addr.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Look up the address a key was last written to.
    pub fn addr_of(&self, key: &str) -> Option<ObjectAddr> {
        self.addr_map.get(key).map(|a| a.clone())
    }

    pub fn object_count(&self) -> u64 {
        self.inner.lock().current_object
    }

    pub fn current_object_size(&self) -> u64 {
        self.inner.lock().current_size
    }
}
