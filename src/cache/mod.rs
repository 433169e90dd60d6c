//! Content-addressed on-disk cache with three namespaces: `objects` (value
//! blobs keyed by long hash), `meta` (per-target records), and `progress`
//! (ephemeral per-run state). Writes are tempfile-then-rename atomic; readers
//! never see partial content.

pub mod hash;
pub mod meta;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::lang::Value;

pub use hash::{LongHashAlgo, ShortHashAlgo};
pub use meta::{FileStamp, MetaRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Objects,
    Meta,
    Progress,
}

impl Namespace {
    fn dir_name(self) -> &'static str {
        match self {
            Namespace::Objects => "objects",
            Namespace::Meta => "meta",
            Namespace::Progress => "progress",
        }
    }
}

/// Per-run target state, readable by external job sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Queued,
    Building,
    Built,
    Failed,
}

impl Progress {
    pub fn as_str(self) -> &'static str {
        match self {
            Progress::Queued => "queued",
            Progress::Building => "building",
            Progress::Built => "built",
            Progress::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "queued" => Some(Progress::Queued),
            "building" => Some(Progress::Building),
            "built" => Some(Progress::Built),
            "failed" => Some(Progress::Failed),
            _ => None,
        }
    }
}

/// Stored hashing configuration; a mismatch invalidates the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct StoreConfig {
    short_hash_algo: ShortHashAlgo,
    long_hash_algo: LongHashAlgo,
}

pub struct Cache {
    root: PathBuf,
    short_algo: ShortHashAlgo,
    long_algo: LongHashAlgo,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Cache {
    pub fn open(root: &Path, short_algo: ShortHashAlgo, long_algo: LongHashAlgo) -> Result<Self> {
        for ns in [Namespace::Objects, Namespace::Meta, Namespace::Progress] {
            std::fs::create_dir_all(root.join(ns.dir_name())).map_err(|e| {
                EngineError::CacheError(format!(
                    "cannot create cache directory {}: {}",
                    root.display(),
                    e
                ))
            })?;
        }

        let cache = Cache {
            root: root.to_path_buf(),
            short_algo,
            long_algo,
            locks: Mutex::new(HashMap::new()),
        };

        let wanted = StoreConfig {
            short_hash_algo: short_algo,
            long_hash_algo: long_algo,
        };
        let config_path = root.join("config");
        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let stored: StoreConfig = serde_json::from_str(&content).map_err(|e| {
                    EngineError::CacheError(format!("corrupt cache config: {}", e))
                })?;
                if stored != wanted {
                    warn!(
                        stored_short = %stored.short_hash_algo,
                        stored_long = %stored.long_hash_algo,
                        "hash algorithms changed; invalidating cache"
                    );
                    cache.clean(None)?;
                    cache.write_config(&config_path, &wanted)?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                cache.write_config(&config_path, &wanted)?;
            }
            Err(e) => {
                return Err(EngineError::CacheError(format!(
                    "cannot read cache config: {}",
                    e
                )))
            }
        }

        Ok(cache)
    }

    /// Open an existing cache, adopting its stored hash configuration.
    /// Workers use this so their hashes always match the master's.
    pub fn open_existing(root: &Path) -> Result<Self> {
        let config_path = root.join("config");
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            EngineError::CacheError(format!(
                "cannot read cache config {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let stored: StoreConfig = serde_json::from_str(&content)
            .map_err(|e| EngineError::CacheError(format!("corrupt cache config: {}", e)))?;
        Self::open(root, stored.short_hash_algo, stored.long_hash_algo)
    }

    fn write_config(&self, path: &Path, config: &StoreConfig) -> Result<()> {
        let bytes = serde_json::to_vec(config)?;
        self.atomic_write(path, &bytes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn short_algo(&self) -> ShortHashAlgo {
        self.short_algo
    }

    pub fn long_algo(&self) -> LongHashAlgo {
        self.long_algo
    }

    pub fn hash_long(&self, bytes: &[u8]) -> String {
        hash::long_hash(self.long_algo, bytes)
    }

    pub fn hash_short(&self, bytes: &[u8]) -> String {
        hash::short_hash(self.short_algo, bytes)
    }

    /// Content hash of a value under the stable serializer, without storing.
    pub fn value_hash(&self, value: &Value) -> Result<String> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.hash_long(&bytes))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| EngineError::CacheError(format!("bad cache path {}", path.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| EngineError::CacheError(format!("cannot create temp file: {}", e)))?;
        tmp.write_all(bytes)
            .map_err(|e| EngineError::CacheError(format!("cannot write {}: {}", path.display(), e)))?;
        tmp.persist(path)
            .map_err(|e| EngineError::CacheError(format!("cannot persist {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn ns_path(&self, ns: Namespace, key: &str) -> PathBuf {
        self.root.join(ns.dir_name()).join(key)
    }

    /// Store a value blob; returns its content hash.
    pub fn put_value(&self, value: &Value) -> Result<String> {
        let bytes = serde_json::to_vec(value)?;
        let hash = self.hash_long(&bytes);
        let lock = self.key_lock(&hash);
        let _guard = lock.lock().expect("key lock poisoned");
        let path = self.ns_path(Namespace::Objects, &hash);
        if !path.exists() {
            self.atomic_write(&path, &bytes)?;
        }
        Ok(hash)
    }

    pub fn get_value(&self, hash: &str) -> Result<Value> {
        let path = self.ns_path(Namespace::Objects, hash);
        let bytes = std::fs::read(&path).map_err(|e| {
            EngineError::CacheError(format!("missing object {}: {}", hash, e))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::CacheError(format!("corrupt object {}: {}", hash, e)))
    }

    pub fn has_value(&self, hash: &str) -> bool {
        self.ns_path(Namespace::Objects, hash).exists()
    }

    pub fn put_meta(&self, meta: &MetaRecord) -> Result<()> {
        let lock = self.key_lock(&meta.target);
        let _guard = lock.lock().expect("key lock poisoned");
        let bytes = serde_json::to_vec_pretty(meta)?;
        self.atomic_write(&self.ns_path(Namespace::Meta, &meta.target), &bytes)
    }

    pub fn get_meta(&self, target: &str) -> Result<Option<MetaRecord>> {
        let path = self.ns_path(Namespace::Meta, target);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::CacheError(format!(
                    "cannot read meta for '{}': {}",
                    target, e
                )))
            }
        };
        let meta = serde_json::from_str(&content).map_err(|e| {
            EngineError::CacheError(format!("corrupt meta for '{}': {}", target, e))
        })?;
        Ok(Some(meta))
    }

    pub fn exists(&self, key: &str, ns: Namespace) -> bool {
        self.ns_path(ns, key).exists()
    }

    pub fn list(&self, ns: Namespace) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.root.join(ns.dir_name()))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn set_progress(&self, target: &str, progress: Progress) -> Result<()> {
        self.atomic_write(
            &self.ns_path(Namespace::Progress, target),
            progress.as_str().as_bytes(),
        )
    }

    pub fn get_progress(&self, target: &str) -> Result<Option<Progress>> {
        match std::fs::read_to_string(self.ns_path(Namespace::Progress, target)) {
            Ok(content) => Ok(Progress::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::CacheError(format!(
                "cannot read progress for '{}': {}",
                target, e
            ))),
        }
    }

    /// Remove the per-run progress namespace at the start of a run.
    pub fn clear_progress(&self) -> Result<()> {
        for name in self.list(Namespace::Progress)? {
            std::fs::remove_file(self.ns_path(Namespace::Progress, &name)).ok();
        }
        Ok(())
    }

    /// Remove cached state for one target, or everything.
    pub fn clean(&self, target: Option<&str>) -> Result<()> {
        match target {
            Some(name) => {
                if let Some(meta) = self.get_meta(name)? {
                    if let Some(hash) = &meta.value_hash {
                        std::fs::remove_file(self.ns_path(Namespace::Objects, hash)).ok();
                    }
                }
                std::fs::remove_file(self.ns_path(Namespace::Meta, name)).ok();
                std::fs::remove_file(self.ns_path(Namespace::Progress, name)).ok();
            }
            None => {
                for ns in [Namespace::Objects, Namespace::Meta, Namespace::Progress] {
                    for name in self.list(ns)? {
                        std::fs::remove_file(self.ns_path(ns, &name)).ok();
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(
            dir.path(),
            ShortHashAlgo::Fnv64,
            LongHashAlgo::Sha256,
        )
        .unwrap();
        (dir, cache)
    }

    #[test]
    fn test_value_round_trip() {
        let (_dir, cache) = open_temp();
        let value = Value::List(vec![Value::Int(1), Value::Str("two".into())]);
        let hash = cache.put_value(&value).unwrap();
        assert!(cache.has_value(&hash));
        assert_eq!(cache.get_value(&hash).unwrap(), value);
    }

    #[test]
    fn test_meta_round_trip_and_list() {
        let (_dir, cache) = open_temp();
        let meta = MetaRecord {
            target: "t".into(),
            command_hash: "c".into(),
            depends_hash: "d".into(),
            value_hash: Some("v".into()),
            output_files: Default::default(),
            seed: 0,
            elapsed_ms: 1,
            finished_at: chrono::Utc::now(),
            error: None,
        };
        cache.put_meta(&meta).unwrap();
        assert!(cache.exists("t", Namespace::Meta));
        assert_eq!(cache.get_meta("t").unwrap().unwrap().command_hash, "c");
        assert_eq!(cache.list(Namespace::Meta).unwrap(), vec!["t"]);
        assert!(cache.get_meta("missing").unwrap().is_none());
    }

    #[test]
    fn test_progress_states() {
        let (_dir, cache) = open_temp();
        cache.set_progress("t", Progress::Building).unwrap();
        assert_eq!(cache.get_progress("t").unwrap(), Some(Progress::Building));
        cache.set_progress("t", Progress::Built).unwrap();
        assert_eq!(cache.get_progress("t").unwrap(), Some(Progress::Built));
        cache.clear_progress().unwrap();
        assert_eq!(cache.get_progress("t").unwrap(), None);
    }

    #[test]
    fn test_algo_mismatch_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::open(dir.path(), ShortHashAlgo::Fnv64, LongHashAlgo::Sha256).unwrap();
            cache.put_value(&Value::Int(1)).unwrap();
            assert_eq!(cache.list(Namespace::Objects).unwrap().len(), 1);
        }
        let cache = Cache::open(dir.path(), ShortHashAlgo::Fnv64, LongHashAlgo::Sha512).unwrap();
        assert!(cache.list(Namespace::Objects).unwrap().is_empty());
    }

    #[test]
    fn test_clean_single_target() {
        let (_dir, cache) = open_temp();
        let hash = cache.put_value(&Value::Int(5)).unwrap();
        let meta = MetaRecord {
            target: "t".into(),
            command_hash: "c".into(),
            depends_hash: "d".into(),
            value_hash: Some(hash.clone()),
            output_files: Default::default(),
            seed: 0,
            elapsed_ms: 0,
            finished_at: chrono::Utc::now(),
            error: None,
        };
        cache.put_meta(&meta).unwrap();
        cache.clean(Some("t")).unwrap();
        assert!(!cache.exists("t", Namespace::Meta));
        assert!(!cache.has_value(&hash));
    }
}
