//! Per-key notification stores and their registry.

use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{KvBackend, KvEntry, KvKey, StoreError};

type Listener<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;

/// Bounds every value type held by a [`KeyStore`].
pub trait StoreValue: DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: DeserializeOwned + Clone + Send + Sync + 'static> StoreValue for T {}

struct Shared<T> {
    key: KvKey,
    serialized_key: String,
    backend: Arc<dyn KvBackend>,
    state: Mutex<State<T>>,
    init_gate: tokio::sync::Mutex<()>,
}

struct State<T> {
    value: Option<T>,
    versionstamp: u64,
    listeners: BTreeMap<u64, Listener<T>>,
    next_listener: u64,
    watch: Option<JoinHandle<()>>,
    // Bumped each time the listener set drains to empty.
    drains: u64,
}

/// The latest value of one key plus the listeners interested in it.
///
/// Obtained from [`KvStore::get_store`]; clones share the same cache,
/// listener set, and watch loop.
///
/// - [`initialize`](Self::initialize) reads the current value and starts
///   the key's single watch loop. It is idempotent while the loop runs.
/// - [`subscribe`](Self::subscribe) registers a listener and immediately
///   hands it the cached value, which is `None` before the first read.
/// - When the last [`Subscription`] goes away the watch loop is aborted;
///   the cached value stays and a later `initialize` starts a new loop.
///
/// A listener that panics is logged and skipped; the others are still
/// notified.
pub struct KeyStore<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for KeyStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: StoreValue> KeyStore<T> {
    fn new(key: KvKey, backend: Arc<dyn KvBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                serialized_key: key.serialize(),
                key,
                backend,
                state: Mutex::new(State {
                    value: None,
                    versionstamp: 0,
                    listeners: BTreeMap::new(),
                    next_listener: 0,
                    watch: None,
                    drains: 0,
                }),
                init_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn key(&self) -> &KvKey {
        &self.shared.key
    }

    /// Last value seen for the key.
    pub fn value(&self) -> Option<T> {
        self.shared.state.lock().value.clone()
    }

    /// Whether a watch loop is currently running for the key.
    pub fn is_initialized(&self) -> bool {
        self.shared
            .state
            .lock()
            .watch
            .as_ref()
            .is_some_and(|watch| !watch.is_finished())
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    /// Reads the current value and starts watching the key.
    ///
    /// Concurrent calls are serialized; once a watch loop is running further
    /// calls return immediately. Listeners are notified if the value read
    /// differs from the cached one. If the last listener unsubscribes while
    /// the call is in flight, the new loop is stopped before it is installed.
    ///
    /// # Errors
    ///
    /// Fails when the backend is closed or the stored value does not
    /// deserialize as `T`.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let _gate = self.shared.init_gate.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        let drains = self.shared.state.lock().drains;

        let mut stream = self.shared.backend.watch(vec![self.shared.key.clone()]).await?;
        let initial = stream.next().await.ok_or(StoreError::Closed)?;
        if let Some(entry) = self.shared.own_entry(initial) {
            self.shared.apply(entry)?;
        }

        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            while let Some(batch) = stream.next().await {
                let Some(shared) = Weak::upgrade(&weak) else {
                    return;
                };
                let Some(entry) = shared.own_entry(batch) else {
                    continue;
                };
                if let Err(e) = shared.apply(entry) {
                    tracing::warn!(key = %shared.serialized_key, error = %e, "ignoring undecodable value");
                }
            }
            tracing::debug!("watch stream ended");
        });

        let mut state = self.shared.state.lock();
        if state.drains != drains && state.listeners.is_empty() {
            handle.abort();
            tracing::debug!(key = %self.shared.serialized_key, "listeners left during initialize, watch stopped");
            return Ok(());
        }
        state.watch = Some(handle);
        tracing::debug!(key = %self.shared.serialized_key, "key store initialized");
        Ok(())
    }

    /// Adds `listener` and calls it right away with the cached value.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`unsubscribed`](Subscription::unsubscribe).
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let (id, current) = {
            let mut state = self.shared.state.lock();
            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.insert(id, Arc::clone(&listener));
            (id, state.value.clone())
        };
        self.shared.invoke(&listener, current.as_ref());

        let weak = Arc::downgrade(&self.shared);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.remove_listener(id);
                }
            })),
        }
    }
}

impl<T: StoreValue> Shared<T> {
    fn own_entry(&self, batch: Vec<KvEntry>) -> Option<KvEntry> {
        batch
            .into_iter()
            .find(|entry| entry.key.serialize() == self.serialized_key)
    }

    // Updates the cache from `entry` and notifies listeners. A batch that
    // repeats the cached versionstamp is a redelivery and is skipped.
    fn apply(&self, entry: KvEntry) -> Result<(), StoreError> {
        let value = entry.value.map(serde_json::from_value::<T>).transpose()?;
        let listeners: Vec<Listener<T>> = {
            let mut state = self.state.lock();
            if entry.versionstamp == state.versionstamp {
                return Ok(());
            }
            state.versionstamp = entry.versionstamp;
            state.value = value.clone();
            state.listeners.values().cloned().collect()
        };
        for listener in &listeners {
            self.invoke(listener, value.as_ref());
        }
        Ok(())
    }

    fn invoke(&self, listener: &Listener<T>, value: Option<&T>) {
        if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            tracing::error!(key = %self.serialized_key, "key store listener panicked");
        }
    }

    fn remove_listener(&self, id: u64) {
        let mut state = self.state.lock();
        if state.listeners.remove(&id).is_none() {
            return;
        }
        if state.listeners.is_empty() {
            state.drains += 1;
            if let Some(watch) = state.watch.take() {
                watch.abort();
                tracing::debug!(key = %self.serialized_key, "last listener left, watch stopped");
            }
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.drains += 1;
        if let Some(watch) = state.watch.take() {
            watch.abort();
        }
    }
}

/// Handle returned by [`KeyStore::subscribe`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

// Type-erased view of a `Shared<T>` kept in the registry.
trait RegisteredStore: Send + Sync {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn teardown(&self);
}

impl<T: StoreValue> RegisteredStore for Shared<T> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn teardown(&self) {
        Shared::teardown(self);
    }
}

/// Registry of [`KeyStore`]s over one backend, one store per key.
///
/// The registry is an ordinary value: construct it where the backend is
/// opened, share it behind an [`Arc`], and call [`shutdown`](Self::shutdown)
/// before closing the backend.
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    stores: Mutex<HashMap<String, Arc<dyn RegisteredStore>>>,
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Returns the store for `key`, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeMismatch`] when the key already has a store with a
    /// different value type.
    pub fn get_store<T: StoreValue>(&self, key: &KvKey) -> Result<KeyStore<T>, StoreError> {
        let serialized = key.serialize();
        let mut stores = self.stores.lock();
        if let Some(existing) = stores.get(&serialized) {
            return Arc::clone(existing)
                .as_any()
                .downcast::<Shared<T>>()
                .map(|shared| KeyStore { shared })
                .map_err(|_| StoreError::TypeMismatch {
                    key: serialized,
                    requested: type_name::<T>(),
                });
        }

        let store = KeyStore::<T>::new(key.clone(), Arc::clone(&self.backend));
        stores.insert(serialized, Arc::clone(&store.shared) as Arc<dyn RegisteredStore>);
        Ok(store)
    }

    /// Number of registered key stores.
    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }

    /// Reads `key` from the backend and decodes it as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &KvKey) -> Result<Option<T>, StoreError> {
        let entry = self.backend.get(key).await?;
        Ok(entry.value.map(serde_json::from_value).transpose()?)
    }

    /// Encodes `value` and writes it to `key`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &KvKey, value: &T) -> Result<(), StoreError> {
        let value: Value = serde_json::to_value(value)?;
        self.backend.set(key, value).await?;
        Ok(())
    }

    /// Stops every watch loop, drops every listener and empties the
    /// registry. Outstanding [`KeyStore`] clones keep their cached values.
    pub fn shutdown(&self) {
        let stores: Vec<_> = self.stores.lock().drain().map(|(_, store)| store).collect();
        for store in &stores {
            store.teardown();
        }
        tracing::info!(stores = stores.len(), "kv store shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::kv::{MemoryKv, WatchStream};

    fn counter() -> KvKey {
        KvKey::from(["counter"])
    }

    fn setup() -> (MemoryKv, KvStore) {
        let backend = MemoryKv::new();
        let store = KvStore::new(Arc::new(backend.clone()));
        (backend, store)
    }

    // Records every value a listener receives.
    fn recorder() -> (Arc<Mutex<Vec<Option<i64>>>>, impl Fn(Option<&i64>) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: Option<&i64>| sink.lock().push(value.copied()))
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn subscribe_before_any_value_gets_none_synchronously() {
        let (_backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (seen, listener) = recorder();
        let _sub = counter.subscribe(listener);
        assert_eq!(*seen.lock(), vec![None]);
    }

    #[tokio::test]
    async fn same_key_shares_one_store() {
        let (_backend, store) = setup();
        let a = store.get_store::<i64>(&counter()).unwrap();
        let b = store.get_store::<i64>(&KvKey::from(["counter"])).unwrap();
        let (_seen, listener) = recorder();
        let _sub = a.subscribe(listener);
        assert_eq!(b.listener_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn requesting_another_type_is_an_error() {
        let (_backend, store) = setup();
        store.get_store::<i64>(&counter()).unwrap();
        assert!(matches!(
            store.get_store::<String>(&counter()),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn initialize_reads_current_value_and_is_idempotent() {
        let (backend, store) = setup();
        store.set(&counter(), &3).await.unwrap();

        let counter = store.get_store::<i64>(&counter()).unwrap();
        counter.initialize().await.unwrap();
        counter.initialize().await.unwrap();
        assert_eq!(counter.value(), Some(3));
        assert!(counter.is_initialized());
        assert_eq!(backend.watcher_count(), 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_change_once() {
        let (_backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        let _s1 = counter.subscribe(l1);
        let _s2 = counter.subscribe(l2);
        counter.initialize().await.unwrap();

        store.set(counter.key(), &1).await.unwrap();
        wait_for(|| first.lock().len() == 2 && second.lock().len() == 2).await;
        store.set(counter.key(), &2).await.unwrap();
        wait_for(|| first.lock().len() == 3 && second.lock().len() == 3).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*first.lock(), vec![None, Some(1), Some(2)]);
        assert_eq!(*second.lock(), vec![None, Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let (_backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let _bad = counter.subscribe(|value: Option<&i64>| {
            if value.is_some() {
                panic!("listener failure");
            }
        });
        let (seen, listener) = recorder();
        let _good = counter.subscribe(listener);
        counter.initialize().await.unwrap();

        store.set(counter.key(), &9).await.unwrap();
        wait_for(|| seen.lock().len() == 2).await;
        assert_eq!(*seen.lock(), vec![None, Some(9)]);
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_watch_and_reinitialize_works() {
        let (backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (_seen, listener) = recorder();
        let sub = counter.subscribe(listener);
        counter.initialize().await.unwrap();
        assert_eq!(backend.watcher_count(), 1);

        sub.unsubscribe();
        assert!(!counter.is_initialized());
        wait_for(|| backend.watcher_count() == 0).await;

        store.set(counter.key(), &4).await.unwrap();
        let (seen, listener) = recorder();
        let _sub = counter.subscribe(listener);
        counter.initialize().await.unwrap();
        assert!(counter.is_initialized());
        assert_eq!(counter.value(), Some(4));
        wait_for(|| seen.lock().last() == Some(&Some(4))).await;

        store.set(counter.key(), &5).await.unwrap();
        wait_for(|| seen.lock().last() == Some(&Some(5))).await;
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let (_backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        {
            let (_seen, listener) = recorder();
            let _sub = counter.subscribe(listener);
            assert_eq!(counter.listener_count(), 1);
        }
        assert_eq!(counter.listener_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_value_fails_initialize() {
        let (backend, store) = setup();
        backend.set(&counter(), json!("not a number")).await.unwrap();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        assert!(matches!(
            counter.initialize().await,
            Err(StoreError::Serialization(_))
        ));
        assert!(!counter.is_initialized());
    }

    #[tokio::test]
    async fn shutdown_stops_watches_and_clears_registry() {
        let (backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (_seen, listener) = recorder();
        let _sub = counter.subscribe(listener);
        counter.initialize().await.unwrap();

        store.shutdown();
        assert!(store.is_empty());
        assert!(!counter.is_initialized());
        wait_for(|| backend.watcher_count() == 0).await;
    }

    #[tokio::test]
    async fn subscribing_before_initialize_keeps_the_loop_across_a_departure() {
        let (_backend, store) = setup();
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (_first_seen, l1) = recorder();
        let first = counter.subscribe(l1);
        counter.initialize().await.unwrap();

        let (seen, l2) = recorder();
        let _second = counter.subscribe(l2);
        first.unsubscribe();
        counter.initialize().await.unwrap();
        assert!(counter.is_initialized());

        store.set(counter.key(), &7).await.unwrap();
        wait_for(|| seen.lock().last() == Some(&Some(7))).await;
    }

    // Backend whose watch streams are fed by hand.
    #[derive(Default)]
    struct ScriptedKv {
        feeds: Mutex<Vec<tokio::sync::mpsc::Sender<Vec<KvEntry>>>>,
    }

    impl ScriptedKv {
        fn watchers(&self) -> usize {
            self.feeds.lock().len()
        }

        fn feed(&self, index: usize) -> tokio::sync::mpsc::Sender<Vec<KvEntry>> {
            self.feeds.lock()[index].clone()
        }
    }

    #[async_trait::async_trait]
    impl KvBackend for ScriptedKv {
        async fn get(&self, key: &KvKey) -> Result<KvEntry, StoreError> {
            Ok(KvEntry {
                key: key.clone(),
                value: None,
                versionstamp: 0,
            })
        }

        async fn set(&self, _key: &KvKey, _value: Value) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn delete(&self, _key: &KvKey) -> Result<(), StoreError> {
            Ok(())
        }

        async fn sum(&self, _key: &KvKey, delta: i64) -> Result<i64, StoreError> {
            Ok(delta)
        }

        async fn watch(&self, _keys: Vec<KvKey>) -> Result<WatchStream, StoreError> {
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            self.feeds.lock().push(tx);
            Ok(WatchStream::new(rx))
        }

        async fn close(&self) {
            self.feeds.lock().clear();
        }
    }

    fn counter_at(value: i64, versionstamp: u64) -> Vec<KvEntry> {
        vec![KvEntry {
            key: counter(),
            value: Some(json!(value)),
            versionstamp,
        }]
    }

    fn spawn_initialize(counter: &KeyStore<i64>) -> tokio::task::JoinHandle<Result<(), StoreError>> {
        let counter = counter.clone();
        tokio::spawn(async move { counter.initialize().await })
    }

    #[tokio::test]
    async fn redelivered_batches_notify_once() {
        let backend = Arc::new(ScriptedKv::default());
        let store = KvStore::new(backend.clone());
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        let _s1 = counter.subscribe(l1);
        let _s2 = counter.subscribe(l2);

        let pending = spawn_initialize(&counter);
        wait_for(|| backend.watchers() == 1).await;
        let feed = backend.feed(0);
        feed.send(counter_at(5, 1)).await.unwrap();
        pending.await.unwrap().unwrap();

        for batch in [counter_at(5, 1), counter_at(6, 2), counter_at(6, 2)] {
            feed.send(batch).await.unwrap();
        }
        wait_for(|| first.lock().len() == 3 && second.lock().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*first.lock(), vec![None, Some(5), Some(6)]);
        assert_eq!(*second.lock(), vec![None, Some(5), Some(6)]);
        assert_eq!(counter.value(), Some(6));
    }

    #[tokio::test]
    async fn unsubscribe_during_initialize_leaves_no_watch() {
        let backend = Arc::new(ScriptedKv::default());
        let store = KvStore::new(backend.clone());
        let counter = store.get_store::<i64>(&counter()).unwrap();
        let (_seen, listener) = recorder();
        let sub = counter.subscribe(listener);

        let pending = spawn_initialize(&counter);
        wait_for(|| backend.watchers() == 1).await;
        sub.unsubscribe();
        let feed = backend.feed(0);
        feed.send(counter_at(1, 1)).await.unwrap();
        pending.await.unwrap().unwrap();

        assert!(!counter.is_initialized());
        assert_eq!(counter.listener_count(), 0);
        timeout(Duration::from_secs(2), feed.closed())
            .await
            .expect("watch stream was not released");
    }

    #[tokio::test]
    async fn initialize_without_listeners_still_starts_the_loop() {
        let backend = Arc::new(ScriptedKv::default());
        let store = KvStore::new(backend.clone());
        let counter = store.get_store::<i64>(&counter()).unwrap();

        let pending = spawn_initialize(&counter);
        wait_for(|| backend.watchers() == 1).await;
        backend.feed(0).send(counter_at(2, 1)).await.unwrap();
        pending.await.unwrap().unwrap();

        assert!(counter.is_initialized());
        assert_eq!(counter.value(), Some(2));
    }

    #[tokio::test]
    async fn helpers_round_trip_typed_values() {
        let (_backend, store) = setup();
        assert_eq!(store.get::<i64>(&counter()).await.unwrap(), None);
        store.set(&counter(), &42).await.unwrap();
        assert_eq!(store.get::<i64>(&counter()).await.unwrap(), Some(42));
    }
}
