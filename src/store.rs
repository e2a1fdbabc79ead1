//! Durable Record Store
//!
//! Access contract used by the AFT subsystem for everything that must
//! survive power loss: the current transfer, registration, history, meters.
//!
//! # Write Model
//!
//! Writes are staged in a [`UnitOfWork`] and applied with [`Store::commit`].
//! A commit is all-or-nothing, so several records (transfer + history + meters)
//! can be made durable together.
//!
//! # File Layout ([`FileStore`])
//!
//! ```text
//! ┌────────────┬───────────┬──────────────────────────────────┐
//! │ magic      │ 4 bytes   │ "AFTS"                           │
//! │ checksum   │ 4 bytes   │ CRC32 of body                    │
//! │ body_len   │ 8 bytes   │ Body size                        │
//! │ body       │ N bytes   │ bincode(BTreeMap<key, record>)   │
//! └────────────┴───────────┴──────────────────────────────────┘
//! ```
//!
//! The whole snapshot is rewritten to a temp file, fsynced and renamed over
//! the previous one.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info};

const MAGIC: &[u8; 4] = b"AFTS";
const HEADER_SIZE: usize = 16;
const SNAPSHOT_FILE: &str = "records.bin";
const TEMP_FILE: &str = "records.tmp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error for {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Unit of Work
// ============================================================================

/// Staged writes applied atomically by [`Store::commit`]
#[derive(Debug, Default)]
pub struct UnitOfWork {
    writes: Vec<(String, Vec<u8>)>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a typed record
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = bincode::serialize(value).map_err(|e| StoreError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.put_raw(key, bytes);
        Ok(())
    }

    /// Stage pre-encoded bytes; later writes to the same key win
    pub fn put_raw(&mut self, key: &str, bytes: Vec<u8>) {
        self.writes.retain(|(k, _)| k != key);
        self.writes.push((key.to_string(), bytes));
    }

    /// Staged bytes for `key`, if any
    pub fn staged(&self, key: &str) -> Option<&[u8]> {
        self.writes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    fn into_writes(self) -> Vec<(String, Vec<u8>)> {
        self.writes
    }
}

// ============================================================================
// Store Contract
// ============================================================================

pub trait Store: Send + Sync {
    /// Read the committed bytes of a record
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every staged write or none of them
    fn commit(&self, work: UnitOfWork) -> Result<(), StoreError>;
}

/// Typed view of a single record
pub struct Persisted<T> {
    store: Arc<dyn Store>,
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Persisted<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key,
            _marker: PhantomData,
        }
    }
}

impl<T> Persisted<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(store: Arc<dyn Store>, key: &'static str) -> Self {
        Self {
            store,
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Load the record, or `T::default()` if it was never written
    pub fn get(&self) -> Result<T, StoreError> {
        match self.store.read(self.key)? {
            Some(bytes) => decode(self.key, &bytes),
            None => Ok(T::default()),
        }
    }

    /// Stage into the ambient unit of work, or commit on its own
    pub fn save(&self, value: &T, work: Option<&mut UnitOfWork>) -> Result<(), StoreError> {
        match work {
            Some(work) => work.put(self.key, value),
            None => {
                let mut work = UnitOfWork::new();
                work.put(self.key, value)?;
                self.store.commit(work)
            }
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-process store; `set_fail_writes` simulates a dead persistence device
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<FxHashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn commit(&self, work: UnitOfWork) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        let mut records = self.records.lock();
        for (key, bytes) in work.into_writes() {
            records.insert(key, bytes);
        }
        Ok(())
    }
}

// ============================================================================
// File Store
// ============================================================================

/// Single-snapshot durable store
pub struct FileStore {
    dir: PathBuf,
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create) the store under `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(SNAPSHOT_FILE);
        let records = if path.exists() {
            let records = load_snapshot(&path)?;
            info!(path = %path.display(), records = records.len(), "Loaded record snapshot");
            records
        } else {
            info!(path = %path.display(), "No record snapshot found, starting empty");
            BTreeMap::new()
        };

        Ok(Self {
            dir,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }
}

impl Store for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn commit(&self, work: UnitOfWork) -> Result<(), StoreError> {
        if work.is_empty() {
            return Ok(());
        }

        let mut records = self.records.lock();
        let mut next = records.clone();
        let count = work.len();
        for (key, bytes) in work.into_writes() {
            next.insert(key, bytes);
        }

        write_snapshot(&self.dir, &next).inspect_err(|e| {
            error!(error = %e, "Record snapshot write failed, keeping previous state");
        })?;
        *records = next;
        debug!(records = count, "Committed unit of work");
        Ok(())
    }
}

fn write_snapshot(dir: &Path, records: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
    let body = bincode::serialize(records).map_err(|e| StoreError::Codec {
        key: "<snapshot>".to_string(),
        reason: e.to_string(),
    })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let checksum = hasher.finalize();

    let tmp_path = dir.join(TEMP_FILE);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(MAGIC)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.write_all(&(body.len() as u64).to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, dir.join(SNAPSHOT_FILE))?;

    // Directory fsync makes the rename durable; not supported everywhere.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE || &bytes[..4] != MAGIC {
        return Err(StoreError::Corrupt("bad header".to_string()));
    }
    let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let body_len = u64::from_le_bytes(len_bytes) as usize;

    let body = HEADER_SIZE
        .checked_add(body_len)
        .and_then(|end| bytes.get(HEADER_SIZE..end))
        .ok_or_else(|| StoreError::Corrupt("truncated body".to_string()))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != checksum {
        return Err(StoreError::Corrupt("checksum mismatch".to_string()));
    }

    bincode::deserialize(body).map_err(|e| StoreError::Corrupt(e.to_string()))
}
