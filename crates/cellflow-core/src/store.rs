//! In-memory key-value state with a durable, debounced subset.
//!
//! Keys carrying the [`DURABLE_PREFIX`] survive restarts: every write to
//! one arms (or re-arms) a debounce timer, and when it fires the durable
//! subset is serialized as a single JSON object and written atomically
//! (temp file, then rename). Repeated writes within the window coalesce
//! into one disk write. `cleanup()` cancels the timer and flushes
//! synchronously so shutdown never loses a debounced write.
//!
//! The store also tracks opaque background-job records and per-category
//! "last checked" timestamps other subsystems use to throttle their own
//! expensive checks.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{Error, Result};

/// Prefix marking keys that are persisted across sessions.
pub const DURABLE_PREFIX: &str = "persist.";

/// Whether a key belongs to the durable subset.
pub fn is_durable(key: &str) -> bool {
    key.starts_with(DURABLE_PREFIX)
}

struct StoreInner {
    entries: HashMap<String, Value>,
    jobs: HashMap<String, Value>,
    last_checked: HashMap<String, Instant>,
    pending_flush: Option<tokio::task::JoinHandle<()>>,
    flushes: u64,
}

struct Shared {
    path: PathBuf,
    debounce: Duration,
    inner: Mutex<StoreInner>,
}

/// Statistics about the state store.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Total keys held in memory.
    pub entries: usize,
    /// Keys in the durable subset.
    pub durable: usize,
    /// Tracked background jobs.
    pub jobs: usize,
    /// Completed disk flushes.
    pub flushes: u64,
    /// Whether a debounced flush is armed.
    pub flush_pending: bool,
}

/// Process-wide key-value state store.
///
/// Cheap to clone; all clones share the same state. Durable writes
/// require a tokio runtime for the debounce timer.
#[derive(Clone)]
pub struct StateStore {
    shared: Arc<Shared>,
}

impl StateStore {
    /// Create a store backed by the given state file.
    ///
    /// Call [`load`](Self::load) afterwards to pull the durable subset
    /// from disk.
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                debounce,
                inner: Mutex::new(StoreInner {
                    entries: HashMap::new(),
                    jobs: HashMap::new(),
                    last_checked: HashMap::new(),
                    pending_flush: None,
                    flushes: 0,
                }),
            }),
        }
    }

    /// Load the durable subset from disk.
    ///
    /// Missing or corrupt state yields an empty store with a warning,
    /// never an error.
    pub fn load(&self) -> usize {
        let path = &self.shared.path;
        if !path.exists() {
            tracing::debug!("No durable state at {:?}", path);
            return 0;
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to read durable state {:?}: {}", path, e);
                return 0;
            }
        };

        let map: HashMap<String, Value> = match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("Corrupt durable state {:?}: {}; starting empty", path, e);
                return 0;
            }
        };

        let mut inner = self.lock();
        let mut count = 0;
        for (key, value) in map {
            if is_durable(&key) {
                inner.entries.insert(key, value);
                count += 1;
            }
        }
        tracing::info!("Loaded {} durable keys", count);
        count
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().entries.get(key).cloned()
    }

    /// Set a value. Durable keys schedule a debounced flush.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let durable = is_durable(&key);
        self.lock().entries.insert(key, value);
        if durable {
            self.schedule_flush();
        }
    }

    /// Whether a key is present.
    pub fn has(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Remove a key. Removing a durable key schedules a flush.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.lock().entries.remove(key);
        if removed.is_some() && is_durable(key) {
            self.schedule_flush();
        }
        removed
    }

    /// Drop everything, including durable keys, and persist the empty set.
    pub fn clear(&self) {
        self.lock().entries.clear();
        self.schedule_flush();
    }

    /// Drop all non-durable keys.
    pub fn clear_volatile(&self) {
        self.lock().entries.retain(|key, _| is_durable(key));
    }

    /// Record an opaque background-job entry.
    pub fn add_job(&self, id: impl Into<String>, record: Value) {
        self.lock().jobs.insert(id.into(), record);
    }

    /// Remove a background-job entry.
    pub fn remove_job(&self, id: &str) -> Option<Value> {
        self.lock().jobs.remove(id)
    }

    /// List background-job entries.
    pub fn jobs(&self) -> Vec<(String, Value)> {
        self.lock()
            .jobs
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Throttle an expensive recurring check.
    ///
    /// Returns `true` (and records the check time) when at least
    /// `interval` has elapsed since the last `true` for this
    /// category/resource pair, or when the pair has never been checked.
    pub fn should_check(&self, category: &str, resource: &str, interval: Duration) -> bool {
        let key = format!("{category}/{resource}");
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.last_checked.get(&key) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                inner.last_checked.insert(key, now);
                true
            }
        }
    }

    /// Cancel any pending debounced flush and write synchronously.
    ///
    /// Invoked at process teardown so no debounced write is lost.
    pub fn cleanup(&self) -> Result<()> {
        if let Some(handle) = self.lock().pending_flush.take() {
            handle.abort();
        }
        self.shared.flush()?;
        tracing::debug!("State store cleaned up");
        Ok(())
    }

    /// Current statistics.
    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            entries: inner.entries.len(),
            durable: inner.entries.keys().filter(|k| is_durable(k)).count(),
            jobs: inner.jobs.len(),
            flushes: inner.flushes,
            flush_pending: inner
                .pending_flush
                .as_ref()
                .is_some_and(|h| !h.is_finished()),
        }
    }

    /// Arm (or re-arm) the debounce timer. Writes within the window
    /// coalesce into a single disk write.
    fn schedule_flush(&self) {
        let shared = Arc::clone(&self.shared);
        let debounce = self.shared.debounce;

        let mut inner = self.lock();
        if let Some(previous) = inner.pending_flush.take() {
            previous.abort();
        }
        inner.pending_flush = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = shared.flush() {
                tracing::warn!("Debounced state flush failed: {}", e);
            }
        }));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Shared {
    /// Write the durable subset to disk atomically.
    ///
    /// Serializes under the lock, writes a temp file, then renames over
    /// the target; a reader never observes a partial file.
    fn flush(&self) -> Result<()> {
        let durable: HashMap<String, Value> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .entries
                .iter()
                .filter(|(key, _)| is_durable(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(&durable)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &bytes)?;
        fs::rename(&temp_path, &self.path)?;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.flushes += 1;
        tracing::debug!(
            "Flushed {} durable keys ({} bytes) to {:?}",
            durable.len(),
            bytes.len(),
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(debounce_ms: u64) -> (StateStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(
            temp.path().join("state.json"),
            Duration::from_millis(debounce_ms),
        );
        (store, temp)
    }

    fn read_state(temp: &TempDir) -> HashMap<String, Value> {
        let bytes = fs::read(temp.path().join("state.json")).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_volatile_round_trip() {
        let (store, _temp) = setup(50);
        store.set("scratch", json!(1));
        assert!(store.has("scratch"));
        assert_eq!(store.get("scratch"), Some(json!(1)));
        assert_eq!(store.remove("scratch"), Some(json!(1)));
        assert!(!store.has("scratch"));
    }

    #[test]
    fn test_clear_volatile_retains_durable_keys() {
        let (store, _temp) = setup(50);
        // Insert without the debounce machinery by writing directly.
        store.lock().entries.insert("persist.debug".into(), json!(true));
        store.lock().entries.insert("scratch".into(), json!(1));

        store.clear_volatile();
        assert!(store.has("persist.debug"));
        assert!(!store.has("scratch"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_sets_coalesce_into_one_write() {
        let (store, temp) = setup(100);

        for i in 1..=5 {
            store.set("persist.counter", json!(i));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.stats().flushes, 1);
        let state = read_state(&temp);
        assert_eq!(state.get("persist.counter"), Some(&json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatile_set_does_not_flush() {
        let (store, temp) = setup(50);
        store.set("scratch", json!(1));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.stats().flushes, 0);
        assert!(!temp.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_cleanup_flushes_pending_write() {
        let (store, temp) = setup(10_000);
        store.set("persist.mode", json!("debug"));

        // Debounce window is far in the future; cleanup must not wait.
        store.cleanup().unwrap();

        assert_eq!(store.stats().flushes, 1);
        let state = read_state(&temp);
        assert_eq!(state.get("persist.mode"), Some(&json!("debug")));
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");

        {
            let store = StateStore::new(&path, Duration::from_millis(10));
            store.set("persist.prompted", json!(true));
            store.set("scratch", json!("gone"));
            store.cleanup().unwrap();
        }

        {
            let store = StateStore::new(&path, Duration::from_millis(10));
            assert_eq!(store.load(), 1);
            assert_eq!(store.get("persist.prompted"), Some(json!(true)));
            assert!(!store.has("scratch"));
        }
    }

    #[test]
    fn test_corrupt_state_yields_empty_store() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = StateStore::new(&path, Duration::from_millis(10));
        assert_eq!(store.load(), 0);
        assert_eq!(store.stats().entries, 0);
    }

    #[test]
    fn test_should_check_throttles_by_interval() {
        let (store, _temp) = setup(50);

        assert!(store.should_check("packages", "doc-1", Duration::from_secs(60)));
        assert!(!store.should_check("packages", "doc-1", Duration::from_secs(60)));
        // Different resource is tracked independently.
        assert!(store.should_check("packages", "doc-2", Duration::from_secs(60)));
        // Zero interval always passes.
        assert!(store.should_check("packages", "doc-1", Duration::ZERO));
    }

    #[test]
    fn test_job_records() {
        let (store, _temp) = setup(50);
        store.add_job("install-1", json!({"pid": 42}));
        store.add_job("install-2", json!({"pid": 43}));

        assert_eq!(store.jobs().len(), 2);
        assert_eq!(store.remove_job("install-1"), Some(json!({"pid": 42})));
        assert_eq!(store.jobs().len(), 1);
        assert_eq!(store.remove_job("install-1"), None);
    }
}
