//! On-disk filter cache
//!
//! Layout under the cache directory:
//!
//! ```text
//! filters.json            serialized CompiledFilterSet (pure subscription content)
//! metadata.json           CacheMetadata
//! snapshots/<list-id>.txt last downloaded raw text of each source
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so
//! a concurrent reader sees either the old file or the new one.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_core::{content_hash, list_id, CompiledFilterSet, FormatError};

pub const CACHE_FORMAT_VERSION: u32 = 1;

const DATA_FILE: &str = "filters.json";
const META_FILE: &str = "metadata.json";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cache not found")]
    NotFound,
    #[error("Cache corrupted: {0}")]
    Corrupted(String),
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to encode filter set: {0}")]
    Format(#[from] FormatError),
    #[error("Failed to encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// sha256 of filters.json
    pub data_hash: String,
    #[serde(default)]
    pub source_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            created_at: now,
            last_used: now,
            data_hash: String::new(),
            source_versions: BTreeMap::new(),
            last_check_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub exists: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Persistence seam for the manager and the updater.
pub trait FilterStore: Send + Sync {
    /// Load and verify the cached set.
    fn load_cached(&self) -> Result<CompiledFilterSet, StoreError>;

    /// Persist `set`, keeping stored source versions and the last check time.
    fn save_cache(&self, set: &CompiledFilterSet) -> Result<(), StoreError>;

    fn cache_info(&self) -> CacheInfo;

    fn source_version(&self, url: &str) -> Option<String>;

    fn set_source_version(&self, url: &str, token: &str) -> Result<(), StoreError>;

    /// Every URL with a recorded version.
    fn source_urls(&self) -> Vec<String>;

    /// Forget versions and snapshots of every URL not in `urls`.
    fn retain_sources(&self, urls: &[String]) -> Result<(), StoreError>;

    fn last_check_time(&self) -> Option<DateTime<Utc>>;

    fn touch_last_check(&self) -> Result<(), StoreError>;

    fn load_snapshot(&self, list_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn save_snapshot(&self, list_id: &str, content: &[u8]) -> Result<(), StoreError>;

    /// Remove every cached file.
    fn invalidate(&self) -> Result<(), StoreError>;
}

pub struct FileFilterStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on metadata.json
    meta_lock: Mutex<()>,
}

impl FileFilterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            meta_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> Option<CacheMetadata> {
        self.read_metadata().ok()
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn snapshot_path(&self, list_id: &str) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR).join(format!("{list_id}.txt"))
    }

    fn lock_meta(&self) -> MutexGuard<'_, ()> {
        match self.meta_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_metadata(&self) -> Result<CacheMetadata, StoreError> {
        let path = self.meta_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupted(format!("unreadable metadata: {e}")))
    }

    fn write_metadata(&self, meta: &CacheMetadata) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.meta_path(), &bytes)
    }

    /// Apply `update` to the stored metadata, starting from a blank record
    /// when none is readable.
    fn update_metadata<F>(&self, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CacheMetadata),
    {
        let _guard = self.lock_meta();
        let mut meta = self
            .read_metadata()
            .unwrap_or_else(|_| CacheMetadata::empty(Utc::now()));
        update(&mut meta);
        self.write_metadata(&meta)
    }
}

impl FilterStore for FileFilterStore {
    fn load_cached(&self) -> Result<CompiledFilterSet, StoreError> {
        // save_cache replaces both files under this guard
        let _guard = self.lock_meta();

        let data_path = self.data_path();
        let data = match fs::read(&data_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(StoreError::io(&data_path, e)),
        };

        let mut meta = match self.read_metadata() {
            Ok(meta) => meta,
            Err(StoreError::NotFound) => {
                return Err(StoreError::Corrupted("metadata missing".to_string()))
            }
            Err(e) => return Err(e),
        };

        if meta.format_version != CACHE_FORMAT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "format version {} (expected {})",
                meta.format_version, CACHE_FORMAT_VERSION
            )));
        }

        let actual = content_hash(&data);
        if actual != meta.data_hash {
            return Err(StoreError::Corrupted(format!(
                "hash mismatch: stored={}, computed={}",
                meta.data_hash, actual
            )));
        }

        let set = CompiledFilterSet::deserialize(&data)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;

        meta.last_used = Utc::now();
        if let Err(e) = self.write_metadata(&meta) {
            log::warn!("Failed to record cache use: {}", e);
        }

        log::debug!(
            "Loaded cached filters: {} network, {} cosmetic",
            set.network_len(),
            set.rule_count() - set.network_len()
        );
        Ok(set)
    }

    fn save_cache(&self, set: &CompiledFilterSet) -> Result<(), StoreError> {
        let data = set.serialize()?;
        let data_hash = content_hash(&data);

        let _guard = self.lock_meta();
        let previous = self.read_metadata().ok();

        write_atomic(&self.data_path(), &data)?;

        let now = Utc::now();
        let mut meta = match previous {
            Some(previous) if previous.format_version == CACHE_FORMAT_VERSION => CacheMetadata {
                last_used: now,
                data_hash: String::new(),
                ..previous
            },
            Some(previous) => CacheMetadata {
                source_versions: previous.source_versions,
                last_check_time: previous.last_check_time,
                ..CacheMetadata::empty(now)
            },
            None => CacheMetadata::empty(now),
        };
        meta.data_hash = data_hash;
        self.write_metadata(&meta)?;

        log::debug!("Saved filter cache ({} bytes) to {}", data.len(), self.dir.display());
        Ok(())
    }

    fn cache_info(&self) -> CacheInfo {
        match fs::metadata(self.data_path()) {
            Ok(stat) => CacheInfo {
                exists: true,
                modified: stat.modified().ok().map(DateTime::<Utc>::from),
            },
            Err(_) => CacheInfo {
                exists: false,
                modified: None,
            },
        }
    }

    fn source_version(&self, url: &str) -> Option<String> {
        let _guard = self.lock_meta();
        self.read_metadata()
            .ok()
            .and_then(|meta| meta.source_versions.get(url).cloned())
    }

    fn set_source_version(&self, url: &str, token: &str) -> Result<(), StoreError> {
        self.update_metadata(|meta| {
            meta.source_versions.insert(url.to_string(), token.to_string());
        })
    }

    fn source_urls(&self) -> Vec<String> {
        let _guard = self.lock_meta();
        self.read_metadata()
            .map(|meta| meta.source_versions.into_keys().collect())
            .unwrap_or_default()
    }

    fn retain_sources(&self, urls: &[String]) -> Result<(), StoreError> {
        let mut dropped = Vec::new();
        self.update_metadata(|meta| {
            meta.source_versions.retain(|url, _| {
                let keep = urls.contains(url);
                if !keep {
                    dropped.push(url.clone());
                }
                keep
            });
        })?;
        for url in dropped {
            let path = self.snapshot_path(&list_id(&url));
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed snapshot of {}", url),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(())
    }

    fn last_check_time(&self) -> Option<DateTime<Utc>> {
        let _guard = self.lock_meta();
        self.read_metadata().ok().and_then(|meta| meta.last_check_time)
    }

    fn touch_last_check(&self) -> Result<(), StoreError> {
        self.update_metadata(|meta| meta.last_check_time = Some(Utc::now()))
    }

    fn load_snapshot(&self, list_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.snapshot_path(list_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn save_snapshot(&self, list_id: &str, content: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.snapshot_path(list_id), content)
    }

    fn invalidate(&self) -> Result<(), StoreError> {
        let _guard = self.lock_meta();
        for path in [self.data_path(), self.meta_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        let snapshots = self.dir.join(SNAPSHOT_DIR);
        match fs::remove_dir_all(&snapshots) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&snapshots, e)),
        }
        log::info!("Invalidated filter cache at {}", self.dir.display());
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, bytes).map_err(|e| StoreError::io(&tmp_path, e))?;
    #[cfg(target_os = "windows")]
    {
        let _ = fs::remove_file(path);
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}
