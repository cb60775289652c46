//! Parse-once descriptor cache.
//!
//! Entries are keyed by canonical path plus content digest, so an edited
//! descriptor is parsed again while unchanged ones are shared across every
//! request in a batch. Concurrent requests for the same key wait on a single
//! in-flight parse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use super::Device;
use crate::digest::{sha256_hex, short};
use crate::error::DescriptorParseError;
use crate::obs;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    digest: String,
}

type Slot = Arc<OnceCell<Arc<Device>>>;

/// Shared, thread-safe cache of parsed descriptors.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: Mutex<HashMap<CacheKey, Slot>>,
    parses: AtomicUsize,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the parsed descriptor at `path`, parsing it at most once per
    /// distinct content.
    pub async fn parse(&self, path: &Path) -> Result<Arc<Device>, DescriptorParseError> {
        self.parse_with_digest(path).await.map(|(device, _)| device)
    }

    /// Like [`DescriptorCache::parse`], also returning the content digest.
    pub async fn parse_with_digest(
        &self,
        path: &Path,
    ) -> Result<(Arc<Device>, String), DescriptorParseError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DescriptorParseError::new(path, None, format!("cannot read: {e}")))?;
        let canonical = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let key = CacheKey {
            path: canonical,
            digest: sha256_hex(&bytes),
        };

        let slot = self.slot(&key);
        if let Some(device) = slot.get() {
            obs::emit_descriptor_cache_hit(&path.display().to_string(), short(&key.digest));
            return Ok((device.clone(), key.digest));
        }

        let origin = path.to_path_buf();
        let digest = key.digest.clone();
        let result = slot
            .get_or_try_init(|| async move {
                self.parses.fetch_add(1, Ordering::SeqCst);
                let display = origin.display().to_string();
                let parsed = tokio::task::spawn_blocking(move || {
                    let text = String::from_utf8(bytes).map_err(|e| {
                        DescriptorParseError::new(&origin, None, format!("not UTF-8: {e}"))
                    })?;
                    super::parse_str(&text, &origin)
                })
                .await
                .map_err(|e| {
                    DescriptorParseError::new(&display, None, format!("parser task failed: {e}"))
                })??;
                obs::emit_descriptor_parsed(&display, short(&digest), parsed.peripherals.len());
                Ok::<_, DescriptorParseError>(Arc::new(parsed))
            })
            .await;
        match result {
            Ok(device) => Ok((device.clone(), key.digest)),
            Err(e) => {
                self.evict_empty(&key, &slot);
                Err(e)
            }
        }
    }

    /// Seed the cache with an already parsed descriptor whose source content
    /// hashes to `digest` (see [`sha256_hex`]).
    pub fn insert(&self, path: &Path, digest: &str, device: Device) {
        let key = CacheKey {
            path: std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            digest: digest.to_string(),
        };
        let slot = self.slot(&key);
        // Already populated slots keep their first value.
        let _ = slot.set(Arc::new(device));
    }

    /// Number of distinct keys seen.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times a descriptor was actually parsed.
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Slot>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        self.lock().entry(key.clone()).or_default().clone()
    }

    /// Drop the slot a failed parse left behind, unless a concurrent
    /// retry has since filled or replaced it.
    fn evict_empty(&self, key: &CacheKey, slot: &Slot) {
        let mut entries = self.lock();
        let stale = entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            entries.remove(key);
        }
    }
}
