//! Loaded index lifecycle
//!
//! A [`CatalogSnapshot`] is an immutable, validated (store, catalog) pair.
//! Serving code reads it through an [`IndexHandle`], which hands out cheap
//! `Arc` clones and swaps in a new snapshot atomically after a rebuild.
//!
//! # On-disk layout
//!
//! ```text
//! <index dir>/
//!   CURRENT               name of the active generation
//!   gen-1718000000000/
//!     vectors.bin
//!     products.json
//! ```
//!
//! A generation directory is fully written and synced before `CURRENT` is
//! replaced (write temp file, rename), so readers never observe half a pair.
//!
//! Writers hold an exclusive lock on `<index dir>/.lock` ([`IndexDirLock`])
//! from the start of a rebuild until `CURRENT` is replaced, so writers in
//! other processes can not interleave or remove each other's generations.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use fd_lock::RwLockWriteGuard;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogIndex, ProductRecord};
use crate::embed::UnitVector;
use crate::store::{FlatStore, VectorStore};
use crate::{Error, Result};

/// File naming the active generation inside an index directory
pub const CURRENT_FILE: &str = "CURRENT";
pub const VECTORS_FILE: &str = "vectors.bin";
pub const PRODUCTS_FILE: &str = "products.json";
/// Lock file serializing writers of an index directory
pub const LOCK_FILE: &str = ".lock";

const GENERATION_PREFIX: &str = "gen-";
const MAX_GENERATION_ATTEMPTS: u32 = 1000;

/// An immutable, count-checked (vector store, catalog) pair
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSnapshot {
    store: FlatStore,
    catalog: CatalogIndex,
    generation: Option<String>,
}

impl CatalogSnapshot {
    /// Pair a store with its catalog, refusing mismatched counts.
    pub fn new(store: FlatStore, catalog: CatalogIndex) -> Result<Self> {
        if store.len() != catalog.len() {
            return Err(Error::CorruptIndex(format!(
                "vector store holds {} rows but catalog holds {} records",
                store.len(),
                catalog.len()
            )));
        }
        Ok(Self {
            store,
            catalog,
            generation: None,
        })
    }

    #[must_use]
    pub fn store(&self) -> &FlatStore {
        &self.store
    }

    #[must_use]
    pub fn catalog(&self) -> &CatalogIndex {
        &self.catalog
    }

    /// Generation directory this snapshot was loaded from or persisted to.
    #[must_use]
    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Top-k search resolved to product records.
    pub fn search(&self, query: &UnitVector, k: usize) -> Result<Vec<(ProductRecord, f32)>> {
        self.store
            .search(query, k)?
            .into_iter()
            .map(|hit| Ok((self.catalog.get(hit.id)?.clone(), hit.score)))
            .collect()
    }

    /// Write the pair as a new generation under `dir` and make it current.
    ///
    /// Waits for the directory lock if another writer holds it. Older
    /// generations are removed afterwards; failing to remove one is logged
    /// and otherwise ignored.
    pub fn persist(&mut self, dir: &Path) -> Result<String> {
        let mut dir_lock = IndexDirLock::open(dir)?;
        let _guard = dir_lock.exclusive()?;
        self.persist_locked(dir)
    }

    /// [`persist`](Self::persist) for a caller already holding the
    /// [`IndexDirLock`] of `dir`.
    pub(crate) fn persist_locked(&mut self, dir: &Path) -> Result<String> {
        fs::create_dir_all(dir)?;
        let (generation, gen_dir) = new_generation_dir(dir)?;

        self.store.persist(&gen_dir.join(VECTORS_FILE))?;
        self.catalog.persist(&gen_dir.join(PRODUCTS_FILE))?;
        sync_dir(&gen_dir)?;

        let tmp = dir.join(format!("{CURRENT_FILE}.{generation}.tmp"));
        fs::write(&tmp, generation.as_bytes())?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, dir.join(CURRENT_FILE))?;
        sync_dir(dir)?;

        info!(
            dir = %dir.display(),
            generation = %generation,
            count = self.len(),
            "persisted index"
        );
        remove_stale_generations(dir, &generation);

        self.generation = Some(generation.clone());
        Ok(generation)
    }

    /// Load the current generation from `dir`.
    ///
    /// A missing `CURRENT` file is `IndexUnavailable`. A generation that is
    /// incomplete or whose store and catalog disagree is `CorruptIndex`.
    pub fn load(dir: &Path) -> Result<Self> {
        let current = dir.join(CURRENT_FILE);
        let generation = match fs::read_to_string(&current) {
            Ok(name) => name.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::IndexUnavailable(format!(
                    "no index found in {}",
                    dir.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if !generation.starts_with(GENERATION_PREFIX) || generation.contains(&['/', '\\'][..]) {
            return Err(Error::CorruptIndex(format!(
                "CURRENT names an invalid generation {generation:?}"
            )));
        }

        let gen_dir = dir.join(&generation);
        let store = FlatStore::load(&gen_dir.join(VECTORS_FILE)).map_err(missing_is_corrupt)?;
        let catalog =
            CatalogIndex::load(&gen_dir.join(PRODUCTS_FILE)).map_err(missing_is_corrupt)?;

        let mut snapshot = Self::new(store, catalog)?;
        snapshot.generation = Some(generation);
        Ok(snapshot)
    }
}

/// Exclusive, cross-process lock on an index directory.
///
/// Held for a whole build-and-persist so that a second rebuild, in this
/// process or another, fails fast instead of racing on `CURRENT`.
pub struct IndexDirLock {
    lock: fd_lock::RwLock<File>,
}

impl IndexDirLock {
    /// Open (creating if needed) the lock file of `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        Ok(Self {
            lock: fd_lock::RwLock::new(file),
        })
    }

    /// Take the lock, failing with `RebuildInProgress` if anyone holds it.
    pub fn try_exclusive(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        self.lock.try_write().map_err(|e| match e.kind() {
            ErrorKind::WouldBlock => Error::RebuildInProgress,
            _ => Error::Io(e),
        })
    }

    /// Take the lock, waiting for the current holder to release it.
    pub fn exclusive(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        Ok(self.lock.write()?)
    }
}

/// The state of the served index
#[derive(Debug, Clone)]
pub enum IndexState {
    /// Nothing has been loaded; carries the reason
    Missing(String),
    /// The persisted pair failed validation and must not be served
    Corrupt(String),
    Ready(Arc<CatalogSnapshot>),
}

/// Shared handle to the snapshot currently being served.
#[derive(Debug)]
pub struct IndexHandle {
    state: RwLock<IndexState>,
}

impl Default for IndexHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexHandle {
    /// A handle with no index loaded.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::Missing("index not loaded".to_string())),
        }
    }

    /// A handle serving `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: CatalogSnapshot) -> Self {
        Self {
            state: RwLock::new(IndexState::Ready(Arc::new(snapshot))),
        }
    }

    /// Current state, cloned out of the lock.
    #[must_use]
    pub fn state(&self) -> IndexState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The snapshot being served, or why there is none.
    pub fn snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        match self.state() {
            IndexState::Ready(snapshot) => Ok(snapshot),
            IndexState::Missing(reason) => Err(Error::IndexUnavailable(reason)),
            IndexState::Corrupt(reason) => Err(Error::CorruptIndex(reason)),
        }
    }

    /// Replace the served snapshot.
    pub fn swap(&self, snapshot: CatalogSnapshot) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = IndexState::Ready(Arc::new(snapshot));
    }

    /// Load the current generation from `dir` and serve it.
    ///
    /// If a snapshot is already being served and the load fails, the old
    /// snapshot stays in place. Otherwise the failure is recorded so that
    /// searches report it instead of returning silently empty results.
    pub fn load_from(&self, dir: &Path) -> Result<usize> {
        match CatalogSnapshot::load(dir) {
            Ok(snapshot) => {
                let count = snapshot.len();
                info!(
                    dir = %dir.display(),
                    generation = ?snapshot.generation(),
                    count,
                    "loaded index"
                );
                self.swap(snapshot);
                Ok(count)
            }
            Err(err) => {
                let mut state = self
                    .state
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if matches!(*state, IndexState::Ready(_)) {
                    warn!(dir = %dir.display(), error = %err, "reload failed, keeping previous index");
                } else if let Error::CorruptIndex(reason) = &err {
                    error!(dir = %dir.display(), reason = %reason, "refusing to serve corrupt index");
                    *state = IndexState::Corrupt(reason.clone());
                } else {
                    warn!(dir = %dir.display(), error = %err, "index not available");
                    *state = IndexState::Missing(err.to_string());
                }
                Err(err)
            }
        }
    }
}

fn missing_is_corrupt(err: Error) -> Error {
    match err {
        Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Error::CorruptIndex(format!("generation is incomplete: {e}"))
        }
        other => other,
    }
}

fn new_generation_dir(dir: &Path) -> Result<(String, PathBuf)> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    for attempt in 0..MAX_GENERATION_ATTEMPTS {
        let name = match attempt {
            0 => format!("{GENERATION_PREFIX}{millis}"),
            n => format!("{GENERATION_PREFIX}{millis}-{n}"),
        };
        let path = dir.join(&name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok((name, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free generation name for {GENERATION_PREFIX}{millis}"),
    )))
}

/// Remove generations other than `written` and the one `CURRENT` names.
/// Must be called with the directory lock held.
fn remove_stale_generations(dir: &Path, written: &str) {
    let current = match fs::read_to_string(dir.join(CURRENT_FILE)) {
        Ok(name) => name.trim().to_string(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "CURRENT unreadable, skipping cleanup");
            return;
        }
    };
    if current != written {
        debug!(current = %current, written, "CURRENT moved on, keeping both generations");
    }

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(GENERATION_PREFIX) && name != written && name != current {
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(generation = name, error = %e, "failed to remove stale generation");
            }
        }
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    fs::File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
