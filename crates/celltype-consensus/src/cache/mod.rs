//! Response cache — content-addressed, persistent store for raw model
//! responses, plus the in-flight guard that deduplicates identical live calls.
//!
//! Entries are keyed by a deterministic fingerprint of (model id, canonical
//! prompt), written once, and never expire on their own; invalidation is the
//! explicit `clear_namespace` operation. A corrupt or unreadable entry is a
//! miss, never an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Collapse all whitespace runs so formatting differences in an otherwise
/// identical prompt cannot change its fingerprint.
pub fn canonicalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic fingerprint of a (model id, prompt) pair, stable across
/// process restarts. Hex-encoded blake3.
pub fn fingerprint(model_id: &str, prompt: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model_id.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(canonicalize(prompt).as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One cached raw response. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub model: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate numbers for a namespace, for reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Persistent response cache rooted at a directory, partitioned by namespace
/// so runs with different configurations do not collide.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    namespace: String,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespace_dir(&self) -> PathBuf {
        self.root.join(&self.namespace)
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.namespace_dir().join(format!("{fingerprint}.json"))
    }

    /// Look up a fingerprint. Corrupt or unreadable entries fall through to a
    /// miss so the caller makes a live call instead.
    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let path = self.entry_path(fingerprint);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable cache entry, treating as miss");
                return None;
            }
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                debug!(fingerprint, "cache hit");
                Some(entry)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt cache entry, treating as miss");
                None
            }
        }
    }

    /// Store a response. The write is all-or-nothing: content goes to a temp
    /// file first and is renamed into place, so an aborted run never leaves a
    /// half-written entry.
    pub fn put(&self, fingerprint: &str, model: &str, response: &str) -> Result<(), CacheError> {
        let dir = self.namespace_dir();
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            model: model.to_string(),
            response: response.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&entry)?;

        let final_path = self.entry_path(fingerprint);
        let tmp_path = dir.join(format!("{fingerprint}.tmp"));
        std::fs::write(&tmp_path, json).map_err(|source| CacheError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &final_path).map_err(|source| CacheError::Io {
            path: final_path.clone(),
            source,
        })?;
        debug!(fingerprint, "cache entry written");
        Ok(())
    }

    /// Remove every entry in this namespace. Explicit invalidation only.
    pub fn clear_namespace(&self) -> Result<(), CacheError> {
        let dir = self.namespace_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path: dir, source }),
        }
    }

    /// Entry count and total size for this namespace.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        let Ok(entries) = std::fs::read_dir(self.namespace_dir()) else {
            return stats;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                stats.entries += 1;
                if let Ok(meta) = entry.metadata() {
                    stats.total_bytes += meta.len();
                }
            }
        }
        stats
    }

    /// Sweep the namespace and delete entries that no longer decode,
    /// returning how many were removed.
    pub fn validate(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(self.namespace_dir()) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let ok = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
                .is_some();
            if !ok && std::fs::remove_file(&path).is_ok() {
                warn!(path = %path.display(), "removed invalid cache entry");
                removed += 1;
            }
        }
        removed
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Per-fingerprint async locks so at most one live gateway call per
/// fingerprint is outstanding. Duplicate requests wait, then hit the cache.
/// A fingerprint's lock is dropped from the map once the last interested
/// caller releases its guard, so the map never outgrows the in-flight set.
#[derive(Default)]
pub struct SingleFlight {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a fingerprint, creating it on first use. Hold the
    /// returned guard across the get-or-invoke sequence.
    pub async fn acquire(&self, fingerprint: &str) -> FlightGuard<'_> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let permit = lock.lock_owned().await;
        FlightGuard {
            flight: self,
            fingerprint: fingerprint.to_string(),
            permit: Some(permit),
        }
    }

    /// Number of fingerprints currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive right to run the live call for one fingerprint. Releasing the
/// guard wakes the next waiter, or removes the map entry when nobody waits.
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    fingerprint: String,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex first; any waiter still holds its own Arc clone
        // and keeps the strong count above one.
        self.permit.take();
        let mut locks = self
            .flight
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(&self.fingerprint) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.fingerprint);
            }
        }
    }
}
