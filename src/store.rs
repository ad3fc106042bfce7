//! Persistent object store shared by the master and its workers.
//!
//! The store maps a run name to successive revisions of its [`Generation`].
//! Writers commit against the version they read; a commit whose base moved
//! fails with [`StoreError::Conflict`] and the caller re-reads and retries.

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::evolution::Generation;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Revisions kept per key by the in-memory store
const MEMORY_REVISIONS: usize = 8;

/// Operations every backend provides
pub trait ObjectStore: Send + Sync {
    /// Newest revision of `key` with its version
    fn get(&self, key: &str) -> Result<Option<(u64, Generation)>, StoreError>;

    /// Publish a new revision. `base` is the version the value was derived
    /// from, or `None` to create the key. Returns the new version.
    fn commit(&self, key: &str, value: &Generation, base: Option<u64>) -> Result<u64, StoreError>;

    /// Make commits from other processes visible
    fn sync(&self) -> Result<(), StoreError>;

    /// Delete revisions older than `before`, always keeping each key's newest.
    /// Returns the number of revisions removed.
    fn pack_upto(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Errors from store backends
#[derive(Debug)]
pub enum StoreError {
    /// The key moved past the base version of a commit
    Conflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    NotFound(String),
    Io(std::io::Error),
    Serialization(bincode::Error),
    InvalidFormat(String),
    VersionMismatch { expected: u32, found: u32 },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict {
                key,
                expected,
                found,
            } => write!(
                f,
                "Conflict on '{}': expected version {:?}, found {:?}",
                key, expected, found
            ),
            Self::NotFound(key) => write!(f, "Key not found: {}", key),
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            Self::VersionMismatch { expected, found } => {
                write!(f, "Version mismatch: expected {}, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CheckpointError> for StoreError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::Io(e) => Self::Io(e),
            CheckpointError::Serialization(e) => Self::Serialization(e),
            CheckpointError::InvalidFormat(msg) => Self::InvalidFormat(msg),
            CheckpointError::VersionMismatch { expected, found } => {
                Self::VersionMismatch { expected, found }
            }
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "store lock poisoned",
    ))
}

/// Open a store by URL: `mem://name`, `file://dir` or a bare directory
pub fn connect(url: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if let Some(name) = url.strip_prefix("mem://") {
        log::debug!("store: memory '{}'", name);
        return Ok(Arc::new(MemoryStore::named(name)?));
    }
    let dir = url.strip_prefix("file://").unwrap_or(url);
    if dir.is_empty() {
        return Err(StoreError::InvalidFormat(format!("bad store url '{}'", url)));
    }
    log::debug!("store: directory '{}'", dir);
    Ok(Arc::new(FileStore::open(dir)?))
}

#[derive(Debug, Clone)]
struct Revision {
    version: u64,
    saved_at: DateTime<Utc>,
    generation: Generation,
}

/// Process-local store; stores opened under the same name share contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Vec<Revision>>>>,
}

static MEMORY_STORES: OnceLock<Mutex<HashMap<String, MemoryStore>>> = OnceLock::new();

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared store registered under `name`
    pub fn named(name: &str) -> Result<Self, StoreError> {
        let registry = MEMORY_STORES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().map_err(|_| poisoned())?;
        Ok(registry.entry(name.to_string()).or_default().clone())
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<(u64, Generation)>, StoreError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner
            .get(key)
            .and_then(|revs| revs.last())
            .map(|r| (r.version, r.generation.clone())))
    }

    fn commit(&self, key: &str, value: &Generation, base: Option<u64>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let revisions = inner.entry(key.to_string()).or_default();
        let current = revisions.last().map(|r| r.version);
        if current != base {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: base,
                found: current,
            });
        }
        let version = current.unwrap_or(0) + 1;
        revisions.push(Revision {
            version,
            saved_at: Utc::now(),
            generation: value.clone(),
        });
        if revisions.len() > MEMORY_REVISIONS {
            let excess = revisions.len() - MEMORY_REVISIONS;
            revisions.drain(..excess);
        }
        Ok(version)
    }

    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn pack_upto(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let mut removed = 0;
        for revisions in inner.values_mut() {
            let newest = revisions.len().saturating_sub(1);
            let old = revisions[..newest]
                .iter()
                .take_while(|r| r.saved_at < before)
                .count();
            revisions.drain(..old);
            removed += old;
        }
        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        let mut keys: Vec<String> = inner.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory store writing one checkpoint file per revision.
///
/// Revisions are named `<key>.<version>.bin` and published with a hard
/// link, which fails if the name already exists; two processes committing
/// the same version therefore see exactly one winner.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_key(key: &str) -> Result<(), StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidFormat(format!("bad key '{}'", key)))
        }
    }

    fn revision_path(&self, key: &str, version: u64) -> PathBuf {
        self.dir.join(format!("{}.{}.bin", key, version))
    }

    /// Every revision file as (key, version, path)
    fn revisions(&self) -> Result<Vec<(String, u64, PathBuf)>, StoreError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".bin") else {
                continue;
            };
            let Some((key, version)) = stem.rsplit_once('.') else {
                continue;
            };
            if let Ok(version) = version.parse::<u64>() {
                out.push((key.to_string(), version, entry.path()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(out)
    }

    fn latest_version(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .revisions()?
            .into_iter()
            .filter(|(k, _, _)| k == key)
            .map(|(_, v, _)| v)
            .max())
    }
}

impl ObjectStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<(u64, Generation)>, StoreError> {
        Self::check_key(key)?;
        // a concurrent pack may remove the file between listing and reading
        for _ in 0..3 {
            let Some(version) = self.latest_version(key)? else {
                return Ok(None);
            };
            match Checkpoint::load(self.revision_path(key, version)) {
                Ok(checkpoint) => return Ok(Some((version, checkpoint.generation))),
                Err(CheckpointError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::NotFound(key.to_string()))
    }

    fn commit(&self, key: &str, value: &Generation, base: Option<u64>) -> Result<u64, StoreError> {
        Self::check_key(key)?;
        let current = self.latest_version(key)?;
        if current != base {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: base,
                found: current,
            });
        }
        let version = current.unwrap_or(0) + 1;
        let temp = self.dir.join(format!(
            ".{}.{}.{}-{}.tmp",
            key,
            version,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        Checkpoint::new(key, value.clone()).save(&temp)?;
        let published = std::fs::hard_link(&temp, self.revision_path(key, version));
        std::fs::remove_file(&temp).ok();
        match published {
            Ok(()) => Ok(version),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StoreError::Conflict {
                key: key.to_string(),
                expected: base,
                found: Some(version),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&self) -> Result<(), StoreError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(StoreError::NotFound(self.dir.display().to_string()))
        }
    }

    fn pack_upto(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let revisions = self.revisions()?;
        let mut newest: HashMap<&str, u64> = HashMap::new();
        for (key, version, _) in &revisions {
            let v = newest.entry(key.as_str()).or_insert(*version);
            *v = (*v).max(*version);
        }
        let mut removed = 0;
        for (key, version, path) in &revisions {
            if newest.get(key.as_str()) == Some(version) {
                continue;
            }
            let modified: DateTime<Utc> = std::fs::metadata(path)?.modified()?.into();
            if modified < before {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.revisions()?.into_iter().map(|(k, _, _)| k).collect();
        keys.dedup();
        Ok(keys)
    }
}

/// A read of one key, edited in place and then committed or dropped
pub struct Transaction<'a> {
    store: &'a dyn ObjectStore,
    key: String,
    base: u64,
    pub generation: Generation,
}

impl<'a> Transaction<'a> {
    pub fn begin(store: &'a dyn ObjectStore, key: &str) -> Result<Self, StoreError> {
        store.sync()?;
        let (base, generation) = store
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(Self {
            store,
            key: key.to_string(),
            base,
            generation,
        })
    }

    /// Version the transaction read
    pub fn version(&self) -> u64 {
        self.base
    }

    pub fn commit(self) -> Result<u64, StoreError> {
        self.store.commit(&self.key, &self.generation, Some(self.base))
    }

    pub fn abort(self) {
        log::trace!("store: abort on '{}' at version {}", self.key, self.base);
    }
}

/// Apply `edit` in a transaction, retrying on conflict.
///
/// `edit` returns `None` to abort without committing. After `retries`
/// conflicts the last conflict is returned.
pub fn update<T>(
    store: &dyn ObjectStore,
    key: &str,
    retries: u32,
    backoff: Duration,
    mut edit: impl FnMut(&mut Generation) -> Option<T>,
) -> Result<Option<T>, StoreError> {
    let mut attempt = 0;
    loop {
        let mut tx = Transaction::begin(store, key)?;
        let Some(out) = edit(&mut tx.generation) else {
            tx.abort();
            return Ok(None);
        };
        match tx.commit() {
            Ok(_) => return Ok(Some(out)),
            Err(e) if e.is_conflict() && attempt < retries => {
                attempt += 1;
                log::warn!("store: {} (retry {}/{})", e, attempt, retries);
                std::thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
