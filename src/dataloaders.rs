//! DataLoader utilities for batch loading
//!
//! Implements the DataLoader pattern for preventing N+1 query problems.
//! See: https://github.com/graphql/dataloader
//!
//! Every key requested while a batch is open is collected into that batch;
//! the batch closes when its delay elapses, when it reaches the configured
//! maximum size, or when [`DataLoader::dispatch`] is called. One
//! [`BatchLoader::load_batch`] call then serves every waiting caller, and the
//! outcome is cached for the rest of the request.
//!
//! A `DataLoader` belongs to exactly one request. Build a fresh one per request
//! (see [`RequestLoaders`](crate::RequestLoaders)) and never share it between
//! requests.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::DataLoaderConfig;
use crate::{FetchError, LoadError};

/// Outcome of one load: `Ok(None)` means the entity does not exist
pub type LoadResult<V> = Result<Option<V>, LoadError>;

/// Batch loader trait for loading multiple items at once
#[async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    type Key: Send + Sync + Clone + Eq + Hash + 'static;
    type Value: Send + Sync + Clone + 'static;

    /// Load batch of items by keys
    ///
    /// `keys` holds no duplicates. Return one entry per key that exists; keys
    /// absent from the map resolve to `None`. Return `Err` only when the
    /// fetch itself failed, every caller in the batch receives that error.
    async fn load_batch(
        &self,
        keys: &[Self::Key],
    ) -> Result<HashMap<Self::Key, Self::Value>, FetchError>;
}

enum Slot<V> {
    Waiting(Vec<oneshot::Sender<LoadResult<V>>>),
    Ready(LoadResult<V>),
}

struct State<K, V> {
    slots: HashMap<K, Slot<V>>,
    pending: Vec<K>,
    generation: u64,
    in_flight: Vec<AbortHandle>,
    cancelled: bool,
}

impl<K, V> State<K, V> {
    fn take_batch(&mut self) -> Vec<K> {
        self.generation += 1;
        mem::take(&mut self.pending)
    }
}

struct Inner<L: BatchLoader> {
    loader: L,
    config: DataLoaderConfig,
    state: Mutex<State<L::Key, L::Value>>,
}

/// DataLoader with caching and batching
///
/// Cloning is cheap and yields a handle onto the same batch and cache.
pub struct DataLoader<L: BatchLoader> {
    inner: Arc<Inner<L>>,
}

impl<L: BatchLoader> DataLoader<L> {
    /// Create new DataLoader with a batch loader and default batching
    pub fn new(loader: L) -> Self {
        Self::with_config(loader, DataLoaderConfig::default())
    }

    /// Create a DataLoader with explicit batching settings
    pub fn with_config(loader: L, config: DataLoaderConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                config,
                state: Mutex::new(State {
                    slots: HashMap::new(),
                    pending: Vec::new(),
                    generation: 0,
                    in_flight: Vec::new(),
                    cancelled: false,
                }),
            }),
        }
    }

    /// The wrapped batch loader
    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// Batching settings in effect
    pub fn config(&self) -> &DataLoaderConfig {
        &self.inner.config
    }

    /// Load a single item by key
    pub async fn load(&self, key: L::Key) -> LoadResult<L::Value> {
        self.enqueue(key).await
    }

    /// Register `key` in the open batch without waiting for it.
    ///
    /// The key joins the batch immediately; awaiting the handle yields its result.
    pub fn enqueue(&self, key: L::Key) -> LoadHandle<L::Value> {
        let mut state = self.inner.lock();
        self.inner.register(&mut state, key)
    }

    /// Load multiple items by keys
    ///
    /// Results line up with `keys`, duplicates included. All keys join the
    /// same batch unless it fills up.
    pub async fn load_many<I>(&self, keys: I) -> Vec<LoadResult<L::Value>>
    where
        I: IntoIterator<Item = L::Key>,
    {
        let handles: Vec<_> = {
            let mut state = self.inner.lock();
            keys.into_iter()
                .map(|key| self.inner.register(&mut state, key))
                .collect()
        };

        let cached = handles.iter().filter(|h| h.is_ready()).count();
        if cached > 0 {
            debug!(requested = handles.len(), cached, "load_many served partly from cache");
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await);
        }
        results
    }

    /// Dispatch the open batch now and wait for it to complete
    pub async fn dispatch(&self) {
        let keys = {
            let mut state = self.inner.lock();
            if state.cancelled || state.pending.is_empty() {
                return;
            }
            state.take_batch()
        };
        self.inner.run_batch(keys).await;
    }

    /// Prime the cache with a value
    ///
    /// Returns `false` without changing anything when the key is already
    /// cached or being loaded.
    pub fn prime(&self, key: L::Key, value: L::Value) -> bool {
        let mut state = self.inner.lock();
        if state.cancelled || state.slots.contains_key(&key) {
            return false;
        }
        state.slots.insert(key, Slot::Ready(Ok(Some(value))));
        true
    }

    /// Drop the cached result for `key` so the next load fetches it again.
    ///
    /// Keys still being loaded are left alone.
    pub fn clear(&self, key: &L::Key) {
        let mut state = self.inner.lock();
        if matches!(state.slots.get(key), Some(Slot::Ready(_))) {
            state.slots.remove(key);
        }
    }

    /// Clear the cache
    pub fn clear_all(&self) {
        let mut state = self.inner.lock();
        state.slots.retain(|_, slot| matches!(slot, Slot::Waiting(_)));
    }

    /// Abort in-flight fetches and release every waiting caller with
    /// [`LoadError::Cancelled`].
    ///
    /// The loader stays cancelled: later loads fail immediately.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether [`DataLoader::cancel`] has run
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }
}

impl<L: BatchLoader> Clone for DataLoader<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: BatchLoader> Inner<L> {
    fn lock(&self) -> MutexGuard<'_, State<L::Key, L::Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        self: &Arc<Self>,
        state: &mut State<L::Key, L::Value>,
        key: L::Key,
    ) -> LoadHandle<L::Value> {
        if state.cancelled {
            return LoadHandle::ready(Err(LoadError::Cancelled));
        }

        match state.slots.get_mut(&key) {
            Some(Slot::Ready(result)) => return LoadHandle::ready(result.clone()),
            Some(Slot::Waiting(waiters)) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                return LoadHandle::waiting(rx);
            }
            None => {}
        }

        let (tx, rx) = oneshot::channel();
        state.slots.insert(key.clone(), Slot::Waiting(vec![tx]));
        state.pending.push(key);

        if state.pending.len() >= self.config.max_batch_size {
            let keys = state.take_batch();
            let inner = Arc::clone(self);
            spawn_tracked(state, async move { inner.run_batch(keys).await });
        } else if state.pending.len() == 1 {
            let generation = state.generation;
            let delay = self.config.delay();
            let inner = Arc::clone(self);
            spawn_tracked(state, async move {
                tokio::time::sleep(delay).await;
                inner.dispatch_generation(generation).await;
            });
        }

        LoadHandle::waiting(rx)
    }

    async fn dispatch_generation(self: Arc<Self>, generation: u64) {
        let keys = {
            let mut state = self.lock();
            // closed early by size or an explicit dispatch
            if state.cancelled || state.generation != generation || state.pending.is_empty() {
                return;
            }
            state.take_batch()
        };
        self.run_batch(keys).await;
    }

    async fn run_batch(&self, keys: Vec<L::Key>) {
        let mut guard = BatchGuard {
            inner: self,
            keys: &keys,
            completed: false,
        };

        debug!(batch_size = keys.len(), "dispatching batch");
        let outcome = self.loader.load_batch(&keys).await;
        self.complete(&keys, outcome);
        guard.completed = true;
    }

    fn complete(
        &self,
        keys: &[L::Key],
        outcome: Result<HashMap<L::Key, L::Value>, FetchError>,
    ) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }

        match outcome {
            Ok(mut values) => {
                for key in keys {
                    let value = values.remove(key);
                    resolve(&mut state, key, Ok(value));
                }
                if !values.is_empty() {
                    warn!(
                        unrequested = values.len(),
                        "batch loader returned keys that were not requested"
                    );
                }
            }
            Err(err) => {
                warn!(batch_size = keys.len(), error = %err, "batch fetch failed");
                let err = LoadError::Fetch(err);
                for key in keys {
                    resolve(&mut state, key, Err(err.clone()));
                }
            }
        }
    }

    fn cancel(&self) {
        let in_flight = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.generation += 1;
            state.pending.clear();

            let mut released = 0usize;
            for (_, slot) in state.slots.drain() {
                if let Slot::Waiting(waiters) = slot {
                    for tx in waiters {
                        released += 1;
                        let _ = tx.send(Err(LoadError::Cancelled));
                    }
                }
            }
            debug!(released, "loader cancelled");
            mem::take(&mut state.in_flight)
        };

        for task in in_flight {
            task.abort();
        }
    }
}

/// Record a fetch task so [`Inner::cancel`] can abort it
fn spawn_tracked<K, V, F>(state: &mut State<K, V>, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    state.in_flight.retain(|handle| !handle.is_finished());
    let handle = tokio::spawn(task);
    state.in_flight.push(handle.abort_handle());
}

/// Move a waiting slot to its final result; every key is resolved at most once
fn resolve<K, V>(state: &mut State<K, V>, key: &K, result: LoadResult<V>)
where
    K: Eq + Hash,
    V: Clone,
{
    let Some(slot) = state.slots.get_mut(key) else {
        return;
    };
    if !matches!(slot, Slot::Waiting(_)) {
        return;
    }
    if let Slot::Waiting(waiters) = mem::replace(slot, Slot::Ready(result.clone())) {
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }
}

/// Releases the batch's waiters if the fetch is dropped before completing
struct BatchGuard<'a, L: BatchLoader> {
    inner: &'a Inner<L>,
    keys: &'a [L::Key],
    completed: bool,
}

impl<L: BatchLoader> Drop for BatchGuard<'_, L> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.inner.lock();
        for key in self.keys {
            if !matches!(state.slots.get(key), Some(Slot::Waiting(_))) {
                continue;
            }
            if let Some(Slot::Waiting(waiters)) = state.slots.remove(key) {
                for tx in waiters {
                    let _ = tx.send(Err(LoadError::Cancelled));
                }
            }
        }
    }
}

/// Pending result of [`DataLoader::enqueue`]
pub struct LoadHandle<V> {
    state: HandleState<V>,
}

enum HandleState<V> {
    Ready(Option<LoadResult<V>>),
    Waiting(oneshot::Receiver<LoadResult<V>>),
}

impl<V> LoadHandle<V> {
    fn ready(result: LoadResult<V>) -> Self {
        Self {
            state: HandleState::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<LoadResult<V>>) -> Self {
        Self {
            state: HandleState::Waiting(rx),
        }
    }

    /// True when the result came straight from the cache
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }
}

// No field is structurally pinned.
impl<V> Unpin for LoadHandle<V> {}

impl<V> Future for LoadHandle<V> {
    type Output = LoadResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(LoadError::Cancelled)))
            }
            HandleState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(LoadError::Cancelled))),
        }
    }
}
