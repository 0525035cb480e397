//! Trace Sink (component D): append-only JSON-lines request trace with
//! size-based rotation and a bounded async queue.
//!
//! Mirrors `background.rs`'s single-consumer task shape; the rotation
//! scheme (`trace.jsonl.N -> .N+1`, then current -> `.1`) is modeled on
//! the teacher's own size-bounded history retention.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::lock::{FileLock, LockError};

#[derive(Debug)]
pub enum TraceError {
    Io(std::io::Error),
    Lock(LockError),
    Serde(serde_json::Error),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Io(e) => write!(f, "trace I/O error: {e}"),
            TraceError::Lock(e) => write!(f, "trace lock error: {e}"),
            TraceError::Serde(e) => write!(f, "trace serialization error: {e}"),
        }
    }
}

impl std::error::Error for TraceError {}

impl From<std::io::Error> for TraceError {
    fn from(e: std::io::Error) -> Self {
        TraceError::Io(e)
    }
}

impl From<LockError> for TraceError {
    fn from(e: LockError) -> Self {
        TraceError::Lock(e)
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Serde(e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub schema_version: u32,
    pub timestamp: String,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub key_label: Option<String>,
    pub key_hash: Option<String>,
    pub rotation_index: Option<usize>,
    pub prompt_hint: Option<String>,
    pub prompt_first_word: Option<String>,
    pub error_code: Option<String>,
}

pub const TRACE_SCHEMA_VERSION: u32 = 1;

struct RotationConfig {
    max_bytes: u64,
    max_backups: u32,
}

fn trace_path(state_dir: &Path) -> PathBuf {
    state_dir.join("trace").join("trace.jsonl")
}

/// Appends one line under lock, rotating first if the file has grown past
/// `max_bytes`.
fn append_locked(state_dir: &Path, entry: &TraceEntry, rotation: &RotationConfig) -> Result<(), TraceError> {
    let path = trace_path(state_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _lock = FileLock::acquire(&path)?;

    if path.exists() && fs::metadata(&path)?.len() >= rotation.max_bytes {
        rotate(&path, rotation.max_backups)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn rotate(path: &Path, max_backups: u32) -> Result<(), TraceError> {
    if max_backups == 0 {
        fs::remove_file(path)?;
        return Ok(());
    }
    let last = path.with_extension(format!("jsonl.{max_backups}"));
    if last.exists() {
        fs::remove_file(&last)?;
    }
    for n in (1..max_backups).rev() {
        let from = path.with_extension(format!("jsonl.{n}"));
        let to = path.with_extension(format!("jsonl.{}", n + 1));
        if from.exists() {
            fs::rename(&from, &to)?;
        }
    }
    let first_backup = path.with_extension("jsonl.1");
    fs::rename(path, first_backup)?;
    Ok(())
}

/// Computes the fairness confidence metric over the last `n` entries:
/// `100 - max(|count - expected| / expected) * 100`, rounded to two
/// decimals. Returns `None` if there are no labeled entries.
pub fn confidence(entries: &[TraceEntry], n: usize) -> Option<f64> {
    let window = &entries[entries.len().saturating_sub(n)..];
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for e in window {
        if let Some(label) = e.key_label.as_deref() {
            *counts.entry(label).or_insert(0) += 1;
        }
    }
    if counts.is_empty() {
        return None;
    }
    let total = window.len() as f64;
    let expected = total / counts.len() as f64;
    let max_dev = counts
        .values()
        .map(|&c| ((c as f64 - expected).abs()) / expected)
        .fold(0.0_f64, f64::max);
    Some(((100.0 - max_dev * 100.0) * 100.0).round() / 100.0)
}

/// Append-only trace writer. Synchronous until [`TraceSink::start`] is
/// called, after which entries flow through a bounded queue.
pub struct TraceSink {
    state_dir: PathBuf,
    rotation: RotationConfig,
    queue: Mutex<Option<mpsc::Sender<TraceEntry>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

const QUEUE_CAPACITY: usize = 1000;

impl TraceSink {
    pub fn new(state_dir: PathBuf, max_bytes: u64, max_backups: u32) -> Self {
        TraceSink {
            state_dir,
            rotation: RotationConfig { max_bytes, max_backups },
            queue: Mutex::new(None),
            consumer: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// Starts the queued consumer task. Before this is called, [`Self::emit`]
    /// writes synchronously.
    pub fn start(self: &std::sync::Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<TraceEntry>(QUEUE_CAPACITY);
        *self.queue.lock().expect("trace queue mutex poisoned") = Some(tx);
        let this = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = append_locked(&this.state_dir, &entry, &this.rotation) {
                    warn!(error = %e, "trace append failed");
                }
            }
        });
        *self.consumer.lock().expect("trace consumer mutex poisoned") = Some(handle);
    }

    /// Enqueues (or, before `start()`, synchronously writes) a trace entry.
    /// Never blocks: on a full queue the entry is dropped and counted.
    pub fn emit(&self, entry: TraceEntry) {
        let sender = self.queue.lock().expect("trace queue mutex poisoned").clone();
        match sender {
            None => {
                if let Err(e) = append_locked(&self.state_dir, &entry, &self.rotation) {
                    warn!(error = %e, "trace append failed (sync path)");
                }
            }
            Some(tx) => {
                if tx.try_send(entry).is_err() {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total.is_power_of_two() || total % 1000 == 0 {
                        warn!(dropped = total, "trace queue full, dropping entries");
                    }
                }
            }
        }
    }

    /// Reads the last `n` entries from `trace.jsonl` for introspection
    /// (e.g. the `_status` endpoint's confidence score). Skips malformed
    /// lines rather than failing the whole read.
    pub fn read_recent(&self, n: usize) -> Vec<TraceEntry> {
        let path = trace_path(&self.state_dir);
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Drains remaining entries then stops the consumer task.
    pub async fn stop(&self) {
        if let Some(tx) = self.queue.lock().expect("trace queue mutex poisoned").take() {
            drop(tx);
        }
        if let Some(handle) = self.consumer.lock().expect("trace consumer mutex poisoned").take() {
            let _ = handle.await;
        }
        debug!(dropped = self.dropped.load(Ordering::Relaxed), "trace sink stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(label: &str) -> TraceEntry {
        TraceEntry {
            schema_version: TRACE_SCHEMA_VERSION,
            timestamp: "2026-01-01T00:00:00Z".into(),
            request_id: "abc".into(),
            method: "GET".into(),
            path: "models".into(),
            status: 200,
            latency_ms: 10,
            key_label: Some(label.to_string()),
            key_hash: Some("hash".into()),
            rotation_index: Some(0),
            prompt_hint: None,
            prompt_first_word: None,
            error_code: None,
        }
    }

    #[test]
    fn sync_emit_before_start_appends_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path().to_path_buf(), 1_000_000, 3);
        sink.emit(sample_entry("a"));
        let content = fs::read_to_string(trace_path(dir.path())).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn rotation_moves_current_to_dot_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "x".repeat(100)).unwrap();
        rotate(&path, 3).unwrap();
        assert!(!path.exists());
        assert!(path.with_extension("jsonl.1").exists());
    }

    #[test]
    fn rotation_with_zero_backups_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "x").unwrap();
        rotate(&path, 0).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn confidence_is_100_for_perfectly_uniform_distribution() {
        let entries: Vec<TraceEntry> = ["a", "b", "a", "b"].iter().map(|l| sample_entry(l)).collect();
        assert_eq!(confidence(&entries, 200), Some(100.0));
    }

    #[test]
    fn confidence_penalizes_skew() {
        let mut entries = Vec::new();
        for _ in 0..9 {
            entries.push(sample_entry("a"));
        }
        entries.push(sample_entry("b"));
        let c = confidence(&entries, 200).unwrap();
        assert!(c < 100.0);
    }

    #[tokio::test]
    async fn queued_mode_drains_entry_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let sink = std::sync::Arc::new(TraceSink::new(dir.path().to_path_buf(), 1_000_000, 3));
        sink.start();
        sink.emit(sample_entry("a"));
        sink.stop().await;
        let content = fs::read_to_string(trace_path(dir.path())).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
