//! Keyed JSON storage with change notification.
//!
//! The layer has three parts:
//!
//! - [`KvBackend`] — the storage contract: point reads and writes, an atomic
//!   integer sum, and a [`WatchStream`] of changes for a set of keys.
//! - [`MemoryKv`] — an in-process backend.
//! - [`KvStore`] / [`KeyStore`] — a registry of per-key stores. Each one
//!   caches the latest value of its key, runs a single watch loop no matter
//!   how many listeners it has, and fans changes out to those listeners.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kiri::kv::{KvKey, KvStore, MemoryKv};
//!
//! # async fn demo() -> Result<(), kiri::kv::StoreError> {
//! let store = KvStore::new(Arc::new(MemoryKv::new()));
//! let counter = store.get_store::<i64>(&KvKey::from(["counter"]))?;
//! let _subscription = counter.subscribe(|value| println!("counter is now {value:?}"));
//! counter.initialize().await?;
//! store.set(&KvKey::from(["counter"]), &1).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

mod memory;
mod store;

pub use memory::MemoryKv;
pub use store::{KeyStore, KvStore, Subscription};

/// Errors produced by the KV layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("key {key} is already registered with a different value type (requested {requested})")]
    TypeMismatch { key: String, requested: &'static str },

    #[error("value at {key} is not an integer")]
    NotANumber { key: String },
}

/// One component of a [`KvKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for KeyPart {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl KeyPart {
    fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::from(*n),
            Self::Str(s) => Value::String(s.clone()),
        }
    }
}

/// An ordered, hierarchical key such as `["users", 42, "profile"]`.
///
/// Two keys are equal exactly when their [serialized](Self::serialize)
/// forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KvKey(Vec<KeyPart>);

impl KvKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Canonical text form: the key as a JSON array, e.g. `["counter"]`.
    pub fn serialize(&self) -> String {
        Value::Array(self.0.iter().map(KeyPart::to_value).collect()).to_string()
    }
}

impl<P: Into<KeyPart>, const N: usize> From<[P; N]> for KvKey {
    fn from(parts: [P; N]) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// A key, its value (if any), and the versionstamp of the write that
/// produced it. Missing keys have versionstamp `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: KvKey,
    pub value: Option<Value>,
    pub versionstamp: u64,
}

/// A stream of change batches for a set of watched keys.
///
/// Each batch holds one [`KvEntry`] per watched key, in the order the keys
/// were given to [`KvBackend::watch`]. The first batch carries the values
/// current when the watch started. After that a batch is emitted whenever
/// any watched key changes; delivery is at-least-once, so a batch may
/// repeat an unchanged versionstamp. The stream ends when the backend is
/// closed. Dropping it stops the watch.
pub struct WatchStream {
    batches: mpsc::Receiver<Vec<KvEntry>>,
}

impl WatchStream {
    /// Wraps a channel a backend feeds batches into.
    pub fn new(batches: mpsc::Receiver<Vec<KvEntry>>) -> Self {
        Self { batches }
    }

    pub async fn next(&mut self) -> Option<Vec<KvEntry>> {
        self.batches.recv().await
    }
}

/// The storage contract the key stores and the demo routes are written
/// against.
///
/// Every operation on a closed backend fails with [`StoreError::Closed`].
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &KvKey) -> Result<KvEntry, StoreError>;

    /// Stores `value` and returns the new versionstamp.
    async fn set(&self, key: &KvKey, value: Value) -> Result<u64, StoreError>;

    async fn delete(&self, key: &KvKey) -> Result<(), StoreError>;

    /// Atomically adds `delta` to the integer at `key` (missing counts as
    /// `0`) and returns the new value.
    async fn sum(&self, key: &KvKey, delta: i64) -> Result<i64, StoreError>;

    async fn watch(&self, keys: Vec<KvKey>) -> Result<WatchStream, StoreError>;

    /// Closes the backend and ends every open watch stream. Idempotent.
    async fn close(&self);
}
