//! In-process [`KvBackend`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use super::{KvBackend, KvEntry, KvKey, StoreError, WatchStream};

/// Capacity of the shared change feed. A watcher that falls further behind
/// receives a fresh snapshot instead of the missed events.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Buffered batches per watch stream.
const WATCH_BUFFER: usize = 16;

/// A [`KvBackend`] kept entirely in memory.
///
/// Reads and writes go through a [`parking_lot::RwLock`]; every write
/// publishes the changed key on a [`broadcast`] channel that each
/// [`WatchStream`] filters for its own keys. Cloning yields another handle
/// to the same data.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

struct Inner {
    entries: RwLock<HashMap<KvKey, (Value, u64)>>,
    versionstamp: AtomicU64,
    changes: Mutex<Option<broadcast::Sender<KvKey>>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                versionstamp: AtomicU64::new(0),
                changes: Mutex::new(Some(changes)),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.changes.lock().is_none()
    }

    /// Number of live watch streams.
    pub fn watcher_count(&self) -> usize {
        self.inner
            .changes
            .lock()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.changes.lock().is_none() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn entry(&self, key: &KvKey) -> KvEntry {
        let entries = self.entries.read();
        match entries.get(key) {
            Some((value, versionstamp)) => KvEntry {
                key: key.clone(),
                value: Some(value.clone()),
                versionstamp: *versionstamp,
            },
            None => KvEntry {
                key: key.clone(),
                value: None,
                versionstamp: 0,
            },
        }
    }

    fn snapshot(&self, keys: &[KvKey]) -> Vec<KvEntry> {
        keys.iter().map(|key| self.entry(key)).collect()
    }

    // Applies `update` under the write lock and publishes the change. The
    // change feed lock is taken first so a concurrent close cannot slip in
    // between the write and the notification.
    fn write<R>(
        &self,
        key: &KvKey,
        update: impl FnOnce(&mut HashMap<KvKey, (Value, u64)>, u64) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let changes = self.changes.lock();
        let Some(feed) = changes.as_ref() else {
            return Err(StoreError::Closed);
        };
        let versionstamp = self.versionstamp.fetch_add(1, Ordering::SeqCst) + 1;
        let result = update(&mut self.entries.write(), versionstamp)?;
        // No receivers just means nobody is watching.
        let _ = feed.send(key.clone());
        Ok(result)
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &KvKey) -> Result<KvEntry, StoreError> {
        self.inner.ensure_open()?;
        Ok(self.inner.entry(key))
    }

    async fn set(&self, key: &KvKey, value: Value) -> Result<u64, StoreError> {
        self.inner.write(key, |entries, versionstamp| {
            entries.insert(key.clone(), (value, versionstamp));
            Ok(versionstamp)
        })
    }

    async fn delete(&self, key: &KvKey) -> Result<(), StoreError> {
        self.inner.write(key, |entries, _| {
            entries.remove(key);
            Ok(())
        })
    }

    async fn sum(&self, key: &KvKey, delta: i64) -> Result<i64, StoreError> {
        self.inner.write(key, |entries, versionstamp| {
            let current = match entries.get(key) {
                None => 0,
                Some((value, _)) => value.as_i64().ok_or_else(|| StoreError::NotANumber {
                    key: key.serialize(),
                })?,
            };
            let total = current.wrapping_add(delta);
            entries.insert(key.clone(), (Value::from(total), versionstamp));
            Ok(total)
        })
    }

    async fn watch(&self, keys: Vec<KvKey>) -> Result<WatchStream, StoreError> {
        let mut changes = match self.inner.changes.lock().as_ref() {
            Some(feed) => feed.subscribe(),
            None => return Err(StoreError::Closed),
        };
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            if tx.send(inner.snapshot(&keys)).await.is_err() {
                return;
            }
            loop {
                let changed = tokio::select! {
                    () = tx.closed() => return,
                    changed = changes.recv() => changed,
                };
                match changed {
                    Ok(key) if !keys.contains(&key) => continue,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "watch fell behind, resending snapshot");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
                if tx.send(inner.snapshot(&keys)).await.is_err() {
                    return;
                }
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn close(&self) {
        if self.inner.changes.lock().take().is_some() {
            tracing::info!("memory kv closed");
        }
    }
}
