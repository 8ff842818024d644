//! Blob storage seam and the persisted key layout.
//!
//! The engine only needs a tiny key-value surface; S3-backed implementations
//! live outside the crate. A filesystem implementation is provided for local
//! runs and tests.

use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Key-value blob store used for compiled bundles, run artifacts, and
/// append-only history.
pub trait Storage: Send + Sync {
    /// Read a JSON object, or `None` when the key does not exist.
    fn read_json_or_null(&self, key: &str) -> Result<Option<Value>>;

    /// Write bytes to a key, replacing any existing object.
    fn write_object(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Append text to a key (JSONL-style logs).
    fn append_text(&self, key: &str, text: &str) -> Result<()>;

    /// Whether a key exists.
    fn object_exists(&self, key: &str) -> Result<bool>;
}

/// Join key parts with `/`, skipping empty segments.
pub fn resolve_output_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Helpers producing the persisted key layout.
pub mod keys {
    use super::resolve_output_key;

    /// `final/{category}/{productId}/spec.json`: latest published spec.
    pub fn published_spec(category: &str, product_id: &str) -> String {
        resolve_output_key(&["final", category, product_id, "spec.json"])
    }

    /// `final/{category}/{productId}/history/runs.jsonl`: append-only history.
    pub fn run_history(category: &str, product_id: &str) -> String {
        resolve_output_key(&["final", category, product_id, "history", "runs.jsonl"])
    }

    /// `final/{category}/{productId}/latest/{artifact}.json`: per-run artifacts.
    pub fn latest_artifact(category: &str, product_id: &str, artifact: &str) -> String {
        resolve_output_key(&[
            "final",
            category,
            product_id,
            "latest",
            &format!("{artifact}.json"),
        ])
    }

    /// `_queue/{category}/state.json`: per-product queue entries.
    pub fn queue_state(category: &str) -> String {
        resolve_output_key(&["_queue", category, "state.json"])
    }

    /// `_runtime/metrics.jsonl`: batched metrics.
    pub fn runtime_metrics() -> String {
        resolve_output_key(&["_runtime", "metrics.jsonl"])
    }

    /// `_review/{category}/queue.json`: review queue snapshot.
    pub fn review_queue(category: &str) -> String {
        resolve_output_key(&["_review", category, "queue.json"])
    }
}

/// Filesystem-backed storage rooted at an output directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create a store rooted at `root`; the directory is created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|seg| seg == "..") {
            return Err(Error::storage(format!("key escapes the root: {key}")));
        }
        Ok(self.root.join(key))
    }
}

impl Storage for FsStorage {
    fn read_json_or_null(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("read {key}: {e}"))),
        }
    }

    fn write_object(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage(format!("mkdir {key}: {e}")))?;
        }
        fs::write(&path, bytes).map_err(|e| Error::storage(format!("write {key}: {e}")))
    }

    fn append_text(&self, key: &str, text: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage(format!("mkdir {key}: {e}")))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("open {key}: {e}")))?;
        file.write_all(text.as_bytes())
            .map_err(|e| Error::storage(format!("append {key}: {e}")))
    }

    fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.exists())
    }
}
