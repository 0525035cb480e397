//! State Store (component C): in-memory rotation state plus debounced,
//! versioned persistence to `<state_dir>/state.json`.
//!
//! Modeled on `background.rs`'s tick-loop style: a dedicated async task
//! owns the debounce timer, woken by a `Notify` rather than polled.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::lock::{atomic_write, FileLock, LockError};
use crate::registry::Registry;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug)]
pub enum StateError {
    Io(std::io::Error),
    Lock(LockError),
    Serde(serde_json::Error),
    FutureSchema(u32),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Io(e) => write!(f, "state I/O error: {e}"),
            StateError::Lock(e) => write!(f, "state lock error: {e}"),
            StateError::Serde(e) => write!(f, "state serialization error: {e}"),
            StateError::FutureSchema(v) => {
                write!(f, "state schema version {v} is newer than this build supports")
            }
        }
    }
}

impl std::error::Error for StateError {}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e)
    }
}

impl From<LockError> for StateError {
    fn from(e: LockError) -> Self {
        StateError::Lock(e)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serde(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Auth,
    PaymentRequired,
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyState {
    pub last_used_at: Option<i64>,
    pub request_count: u64,
    pub err_401: u64,
    pub err_403: u64,
    pub err_429: u64,
    pub err_5xx: u64,
    pub exhausted_until: Option<i64>,
    pub blocked_until: Option<i64>,
    pub blocked_reason: Option<BlockReason>,
}

impl KeyState {
    pub fn is_exhausted(&self, now: i64) -> bool {
        self.exhausted_until.map(|t| now < t).unwrap_or(false)
    }

    pub fn is_blocked(&self, now: i64) -> bool {
        match self.blocked_until {
            Some(t) if t <= 0 => true,
            Some(t) => now < t,
            None => false,
        }
    }

    pub fn error_rate_for_scoring(&self) -> f64 {
        (self.err_429 + self.err_5xx) as f64 / self.request_count.max(1) as f64
    }

    pub fn error_rate_for_operators(&self) -> f64 {
        (self.err_403 + self.err_429 + self.err_5xx) as f64 / self.request_count.max(1) as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub schema_version: u32,
    pub active_index: usize,
    pub rotation_index: usize,
    pub auto_rotate: bool,
    pub last_health_refresh_at: Option<i64>,
    pub keys: HashMap<String, KeyState>,
}

impl Default for State {
    fn default() -> Self {
        State {
            schema_version: CURRENT_SCHEMA_VERSION,
            active_index: 0,
            rotation_index: 0,
            auto_rotate: true,
            last_health_refresh_at: None,
            keys: HashMap::new(),
        }
    }
}

impl State {
    fn reconcile(&mut self, registry: &Registry) {
        for cred in registry.iter() {
            self.keys.entry(cred.label.clone()).or_default();
        }
        if registry.is_empty() {
            self.rotation_index = 0;
            self.active_index = 0;
        } else {
            self.rotation_index %= registry.len();
            self.active_index %= registry.len();
        }
    }
}

/// Applies pending schema migrations in order, one version step at a time.
fn migrate(mut doc: serde_json::Value) -> Result<serde_json::Value, StateError> {
    let version = doc.get("schema_version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(StateError::FutureSchema(version));
    }
    let mut v = version;
    while v < CURRENT_SCHEMA_VERSION {
        doc = migrate_step(v, doc);
        v += 1;
    }
    Ok(doc)
}

/// A single `v → v+1` migration. Each step is a pure function over the raw
/// document so historical fixtures can be asserted against in tests.
fn migrate_step(from_version: u32, mut doc: serde_json::Value) -> serde_json::Value {
    match from_version {
        1 => {
            // v1 had no `auto_rotate` field; default it on.
            if let Some(obj) = doc.as_object_mut() {
                obj.entry("auto_rotate").or_insert(serde_json::Value::Bool(true));
                obj.insert("schema_version".into(), serde_json::Value::from(2));
            }
            doc
        }
        _ => doc,
    }
}

fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state.json")
}

/// Loads state from `<state_dir>/state.json` under lock. Missing or corrupt
/// documents yield a fresh zeroed state; corrupt files are moved aside with
/// a timestamped suffix rather than overwritten.
pub fn load(state_dir: &Path, registry: &Registry, clock: &dyn Clock) -> Result<State, StateError> {
    let path = state_path(state_dir);
    let _lock = FileLock::acquire(&path)?;

    let mut state = if !path.exists() {
        State::default()
    } else {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(raw) => match migrate(raw) {
                    Ok(migrated) => match serde_json::from_value::<State>(migrated) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "state document failed to deserialize after migration, resetting");
                            quarantine(&path, clock)?;
                            State::default()
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "state schema migration failed, resetting");
                        quarantine(&path, clock)?;
                        State::default()
                    }
                },
                Err(e) => {
                    warn!(error = %e, "state document is not valid JSON, resetting");
                    quarantine(&path, clock)?;
                    State::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "state document unreadable, resetting");
                State::default()
            }
        }
    };
    state.reconcile(registry);
    Ok(state)
}

fn quarantine(path: &Path, clock: &dyn Clock) -> Result<(), StateError> {
    let dest = path.with_extension(format!("json.corrupt.{}", clock.now_epoch()));
    fs::rename(path, dest)?;
    Ok(())
}

/// Atomically writes the full state document.
pub fn save(state_dir: &Path, state: &State) -> Result<(), StateError> {
    let path = state_path(state_dir);
    let bytes = serde_json::to_vec_pretty(state)?;
    atomic_write(&path, &bytes)?;
    Ok(())
}

/// Owns the in-memory [`State`] plus the debounced flusher task.
pub struct StateStore {
    state_dir: PathBuf,
    inner: Arc<Mutex<State>>,
    dirty: Arc<AtomicBool>,
    notify: Arc<Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl StateStore {
    pub fn new(state_dir: PathBuf, initial: State) -> Self {
        StateStore {
            state_dir,
            inner: Arc::new(Mutex::new(initial)),
            dirty: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            flusher: Mutex::new(None),
        }
    }

    /// Runs `f` with exclusive access to the state under the state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.inner.lock().expect("state mutex poisoned");
        f(&mut guard)
    }

    pub fn snapshot(&self) -> State {
        self.inner.lock().expect("state mutex poisoned").clone()
    }

    /// Non-blocking: sets the dirty flag and wakes the flusher.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Starts the debounce flusher task.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                this.notify.notified().await;
                loop {
                    match tokio::time::timeout(DEBOUNCE, this.notify.notified()).await {
                        Ok(()) => continue,
                        Err(_elapsed) => break,
                    }
                }
                if this.dirty.swap(false, Ordering::SeqCst) {
                    this.flush_once();
                }
            }
        });
        *self.flusher.lock().expect("flusher mutex poisoned") = Some(handle);
    }

    fn flush_once(&self) {
        let snapshot = self.snapshot();
        match save(&self.state_dir, &snapshot) {
            Ok(()) => debug!("state flushed to disk"),
            Err(e) => warn!(error = %e, "state flush failed, will retry on next dirty signal"),
        }
    }

    /// Stops the flusher task and performs one final synchronous write.
    pub async fn stop(&self) {
        if let Some(handle) = self.flusher.lock().expect("flusher mutex poisoned").take() {
            handle.abort();
        }
        self.flush_once();
        info!("state store stopped");
    }

    pub fn record_request(&self, label: &str, status: u16) {
        self.with_state(|s| {
            let now = crate::clock::SystemClock.now_epoch();
            let ks = s.keys.entry(label.to_string()).or_default();
            ks.request_count += 1;
            ks.last_used_at = Some(now);
            match status {
                401 => ks.err_401 += 1,
                403 => ks.err_403 += 1,
                429 => ks.err_429 += 1,
                500..=599 => ks.err_5xx += 1,
                _ => {}
            }
        });
        self.mark_dirty();
    }

    pub fn mark_exhausted(&self, label: &str, seconds: i64, now: i64) {
        self.with_state(|s| {
            let ks = s.keys.entry(label.to_string()).or_default();
            ks.exhausted_until = Some(now + seconds);
        });
        self.mark_dirty();
    }

    pub fn mark_blocked(&self, label: &str, reason: BlockReason, seconds: i64, now: i64) {
        self.with_state(|s| {
            let ks = s.keys.entry(label.to_string()).or_default();
            ks.blocked_until = Some(if seconds <= 0 { 0 } else { now + seconds });
            ks.blocked_reason = Some(reason);
        });
        self.mark_dirty();
    }

    pub fn clear_block(&self, label: &str) {
        self.with_state(|s| {
            let ks = s.keys.entry(label.to_string()).or_default();
            ks.blocked_until = None;
            ks.blocked_reason = None;
            ks.err_401 = 0;
        });
        self.mark_dirty();
    }

    pub fn is_blocked(&self, label: &str, now: i64) -> bool {
        self.with_state(|s| {
            s.keys
                .get(label)
                .map(|ks| ks.is_blocked(now))
                .unwrap_or(false)
        })
    }

    pub fn is_exhausted(&self, label: &str, now: i64) -> bool {
        self.with_state(|s| {
            s.keys
                .get(label)
                .map(|ks| ks.is_exhausted(now))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::Credential;

    fn registry() -> Registry {
        Registry::new(vec![
            Credential::new("a", "sk-aaaaaaaaaaaaaaaa", None, 0, false),
            Credential::new("b", "sk-bbbbbbbbbbbbbbbb", None, 0, false),
        ])
        .unwrap()
    }

    #[test]
    fn load_missing_file_yields_zeroed_state_with_all_labels() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let state = load(dir.path(), &reg, &SystemClock).unwrap();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(state.keys.contains_key("a"));
        assert!(state.keys.contains_key("b"));
    }

    #[test]
    fn round_trip_save_then_load_is_equivalent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let mut state = State::default();
        state.keys.insert("a".into(), KeyState::default());
        state.keys.insert("b".into(), KeyState::default());
        state.rotation_index = 1;
        save(dir.path(), &state).unwrap();
        let loaded = load(dir.path(), &reg, &SystemClock).unwrap();
        assert_eq!(loaded.rotation_index, 1);
    }

    #[test]
    fn corrupt_file_is_quarantined_and_state_resets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("state.json"), b"not json at all").unwrap();
        let reg = registry();
        let state = load(dir.path(), &reg, &SystemClock).unwrap();
        assert_eq!(state.rotation_index, 0);
        let mut found_quarantine = false;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with("state.json.corrupt.")
            {
                found_quarantine = true;
            }
        }
        assert!(found_quarantine);
    }

    #[test]
    fn migration_from_v1_adds_auto_rotate() {
        let raw = serde_json::json!({
            "schema_version": 1,
            "active_index": 0,
            "rotation_index": 0,
            "last_health_refresh_at": null,
            "keys": {}
        });
        let migrated = migrate(raw).unwrap();
        assert_eq!(migrated["schema_version"], 2);
        assert_eq!(migrated["auto_rotate"], true);
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let raw = serde_json::json!({"schema_version": 99});
        assert!(migrate(raw).is_err());
    }

    #[tokio::test]
    async fn mark_dirty_eventually_flushes_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let state = load(dir.path(), &reg, &SystemClock).unwrap();
        let store = Arc::new(StateStore::new(dir.path().to_path_buf(), state));
        store.start();
        store.mark_dirty();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(dir.path().join("state.json").exists());
        store.stop().await;
    }

    #[test]
    fn is_blocked_with_nonpositive_until_is_indefinite() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let state = load(dir.path(), &reg, &SystemClock).unwrap();
        let store = StateStore::new(dir.path().to_path_buf(), state);
        store.mark_blocked("a", BlockReason::Manual, 0, 1000);
        assert!(store.is_blocked("a", 999_999));
    }
}
