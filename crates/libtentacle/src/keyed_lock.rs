//! Reference-counted locks keyed by an arbitrary value.
//!
//! An entry is created the first time a key is requested and removed once
//! no holder or waiter remains, so the table only ever holds keys that are
//! in active use. Waiters are served in arrival order.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Outcome of a lock request. `NotAcquired` means the caller's token was
/// cancelled before the lock was obtained.
#[must_use = "the lock is released as soon as the acquisition is dropped"]
#[derive(Debug)]
pub enum Acquisition<G> {
    Acquired(G),
    NotAcquired,
}

impl<G> Acquisition<G> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }

    pub fn into_guard(self) -> Option<G> {
        match self {
            Acquisition::Acquired(guard) => Some(guard),
            Acquisition::NotAcquired => None,
        }
    }
}

struct Entry<P> {
    primitive: Arc<P>,
    reference_count: usize,
}

struct Table<K, P> {
    entries: Mutex<HashMap<K, Entry<P>>>,
}

impl<K, P> Table<K, P>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<P>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(&self, key: &K, create: impl FnOnce() -> P) -> Arc<P> {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            primitive: Arc::new(create()),
            reference_count: 0,
        });
        entry.reference_count += 1;
        Arc::clone(&entry.primitive)
    }

    fn release(&self, key: &K) {
        let mut entries = self.lock();
        let remove = match entries.get_mut(key) {
            Some(entry) => {
                entry.reference_count = entry.reference_count.saturating_sub(1);
                entry.reference_count == 0
            }
            None => false,
        };
        if remove {
            entries.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn reference_count(&self, key: &K) -> usize {
        self.lock().get(key).map_or(0, |e| e.reference_count)
    }
}

/// Holds a keyed lock until dropped.
pub struct KeyedGuard<K, P, G>
where
    K: Eq + Hash + Clone,
{
    guard: Option<G>,
    key: K,
    table: Arc<Table<K, P>>,
}

impl<K, P, G> KeyedGuard<K, P, G>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, P, G> Drop for KeyedGuard<K, P, G>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // Release the primitive before the table entry can disappear.
        drop(self.guard.take());
        self.table.release(&self.key);
    }
}

impl<K, P, G> std::fmt::Debug for KeyedGuard<K, P, G>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.key).finish()
    }
}

/// A reference taken on a table entry. Released on drop unless handed to a
/// [`KeyedGuard`], so a waiter whose future is dropped still lets go.
struct Checkout<'a, K, P>
where
    K: Eq + Hash + Clone,
{
    table: &'a Arc<Table<K, P>>,
    key: K,
    armed: bool,
}

impl<K, P> Checkout<'_, K, P>
where
    K: Eq + Hash + Clone,
{
    fn into_guard<G>(mut self, guard: G) -> KeyedGuard<K, P, G> {
        self.armed = false;
        KeyedGuard {
            guard: Some(guard),
            key: self.key.clone(),
            table: Arc::clone(self.table),
        }
    }
}

impl<K, P> Drop for Checkout<'_, K, P>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.armed {
            self.table.release(&self.key);
        }
    }
}

async fn acquire<K, P, G, F, Fut>(
    table: &Arc<Table<K, P>>,
    key: K,
    cancel: &CancellationToken,
    create: impl FnOnce() -> P,
    obtain: F,
) -> Acquisition<KeyedGuard<K, P, G>>
where
    K: Eq + Hash + Clone,
    F: FnOnce(Arc<P>) -> Fut,
    Fut: Future<Output = Option<G>>,
{
    if cancel.is_cancelled() {
        return Acquisition::NotAcquired;
    }

    let primitive = table.checkout(&key, create);
    let checkout = Checkout {
        table,
        key,
        armed: true,
    };
    let obtained = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        guard = obtain(primitive) => guard,
    };

    match obtained {
        Some(guard) => Acquisition::Acquired(checkout.into_guard(guard)),
        None => Acquisition::NotAcquired,
    }
}

pub type SemaphoreReleaser<K> = KeyedGuard<K, Semaphore, OwnedSemaphorePermit>;

/// A binary semaphore per key.
pub struct KeyedSemaphore<K>
where
    K: Eq + Hash + Clone,
{
    table: Arc<Table<K, Semaphore>>,
}

impl<K> KeyedSemaphore<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(Table::new()),
        }
    }

    pub async fn wait(&self, key: K, cancel: &CancellationToken) -> Acquisition<SemaphoreReleaser<K>> {
        trace!(key = ?key, "waiting on keyed semaphore");
        acquire(
            &self.table,
            key,
            cancel,
            || Semaphore::new(1),
            |semaphore| async move { semaphore.acquire_owned().await.ok() },
        )
        .await
    }

    /// Number of keys with a holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.table.len()
    }

    pub fn reference_count(&self, key: &K) -> usize {
        self.table.reference_count(key)
    }
}

impl<K> Default for KeyedSemaphore<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for KeyedSemaphore<K>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

pub type WriteReleaser<K> = KeyedGuard<K, RwLock<()>, OwnedRwLockWriteGuard<()>>;
pub type ReadReleaser<K> = KeyedGuard<K, RwLock<()>, OwnedRwLockReadGuard<()>>;

/// A read/write lock per key. `lock` is the exclusive side.
pub struct KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    table: Arc<Table<K, RwLock<()>>>,
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(Table::new()),
        }
    }

    pub async fn lock(&self, key: K, cancel: &CancellationToken) -> Acquisition<WriteReleaser<K>> {
        trace!(key = ?key, "waiting on keyed write lock");
        acquire(
            &self.table,
            key,
            cancel,
            || RwLock::new(()),
            |lock| async move { Some(lock.write_owned().await) },
        )
        .await
    }

    pub async fn read(&self, key: K, cancel: &CancellationToken) -> Acquisition<ReadReleaser<K>> {
        acquire(
            &self.table,
            key,
            cancel,
            || RwLock::new(()),
            |lock| async move { Some(lock.read_owned().await) },
        )
        .await
    }

    pub fn active_keys(&self) -> usize {
        self.table.len()
    }

    pub fn reference_count(&self, key: &K) -> usize {
        self.table.reference_count(key)
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K> std::fmt::Debug for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLock")
            .field("active_keys", &self.table.len())
            .finish()
    }
}
