use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Key/value store for built contexts. Failures never surface from `get`:
/// anything unreadable is a miss.
pub trait CacheProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[derive(Debug, Default)]
pub struct InMemoryCacheProvider {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheProvider for InMemoryCacheProvider {
    fn get(&self, key: &str) -> Option<String> {
        match self.entries.lock() {
            Ok(entries) => entries.get(key).cloned(),
            Err(_) => {
                warn!("In-memory cache lock poisoned; treating as miss");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    content: String,
}

/// One JSON file per entry, named by the SHA-256 of the key.
#[derive(Debug, Clone)]
pub struct FileSystemCacheProvider {
    cache_dir: PathBuf,
}

impl FileSystemCacheProvider {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| {
            Error::Cache(format!("cannot create cache dir {}: {}", cache_dir.display(), e))
        })?;
        info!("Initialized file system cache at '{}'", cache_dir.display());
        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn key_to_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", sha256_hex(key)))
    }
}

impl CacheProvider for FileSystemCacheProvider {
    fn get(&self, key: &str) -> Option<String> {
        let path = self.key_to_path(key);
        if !path.is_file() {
            return None;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(entry) => Some(entry.content),
            Err(e) => {
                error!("Failed to read cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        let path = self.key_to_path(key);
        let entry = CacheEntry {
            content: value.to_string(),
        };
        let written = serde_json::to_string_pretty(&entry)
            .map_err(|e| e.to_string())
            .and_then(|raw| fs::write(&path, raw).map_err(|e| e.to_string()));
        if let Err(e) = written {
            error!("Failed to write cache file {}: {}", path.display(), e);
        }
    }
}
