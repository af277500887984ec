use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::time::Instant;
use crate::utils::CallOnDrop;

type SharedLoad<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// The observable state of a key in a [`SingleFlightCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    /// A loader is running and its result has not been observed yet.
    InFlight,
    /// The loader succeeded, and its value is being served from memory.
    Succeeded,
}

#[derive(Clone, Copy, Debug)]
enum EntryState {
    InFlight,
    Succeeded(Instant),
}

struct Entry<V, E> {
    generation: u64,
    state: EntryState,
    load: SharedLoad<V, E>,
}

struct Slots<K, V, E> {
    entries: HashMap<K, Entry<V, E>>,
    next_generation: u64,
}

type SlotsRef<K, V, E> = Arc<Mutex<Slots<K, V, E>>>;

/// A handle to the outcome of one load of a [`SingleFlightCache`].
///
/// All handles that were returned for the same generation of a key resolve to clones of the
/// same result. Dropping a handle never cancels the load for other handles.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Lookup<V, E> {
    inner: SharedLoad<V, E>,
}

impl<V, E> Clone for Lookup<V, E> {
    fn clone(&self) -> Self {
        Lookup {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> Future for Lookup<V, E>
where
    V: Clone,
    E: Clone,
{
    type Output = Result<V, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<V, E> fmt::Debug for Lookup<V, E>
where
    V: Clone,
    E: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup")
            .field("settled", &self.inner.peek().is_some())
            .finish()
    }
}

/// An in-memory cache for async lookups that does request coalescing.
///
/// At most one loader runs per key at a time. Every caller asking for a key while its loader
/// is running gets a handle to the same computation, and every caller asking after it
/// succeeded gets the stored value. A failed load is removed from the cache before its error
/// is handed to the waiting callers, so the next [`get`](Self::get) starts a fresh load.
///
/// Successful values are kept indefinitely, unless a [`retention`](CacheConfig::retention)
/// is configured or they are explicitly [invalidated](Self::invalidate).
///
/// The cache is cheap to clone, and clones share their entries.
pub struct SingleFlightCache<K, V, E> {
    config: Arc<CacheConfig>,
    slots: SlotsRef<K, V, E>,
}

impl<K, V, E> Clone for SingleFlightCache<K, V, E> {
    fn clone(&self) -> Self {
        SingleFlightCache {
            config: Arc::clone(&self.config),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, V, E> fmt::Debug for SingleFlightCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .slots
            .try_lock()
            .map(|slots| slots.entries.len())
            .unwrap_or_default();
        f.debug_struct("SingleFlightCache")
            .field("config", &self.config)
            .field("in-memory entries", &entries)
            .finish()
    }
}

impl<K, V, E> Default for SingleFlightCache<K, V, E> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<K, V, E> SingleFlightCache<K, V, E> {
    /// Creates a new, empty cache.
    pub fn new(config: CacheConfig) -> Self {
        SingleFlightCache {
            config: Arc::new(config),
            slots: Arc::new(Mutex::new(Slots {
                entries: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// The configuration this cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The number of stored entries, both in-flight and succeeded.
    ///
    /// Succeeded entries past their retention are counted until they are looked up again.
    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Returns `true` if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all entries.
    ///
    /// Loads that are currently running still resolve for the callers holding their
    /// [`Lookup`], but their results are not stored.
    pub fn invalidate_all(&self) {
        let entries = {
            let mut slots = self.slots.lock();
            std::mem::take(&mut slots.entries)
        };
        metric!(counter("caches.invalidated") += entries.len() as i64, "cache" => self.name());
        metric!(gauge("caches.entries") = 0u64, "cache" => self.name());
        tracing::debug!(cache = self.name(), count = entries.len(), "Invalidated all entries");
        // Dropping an entry can drop the last reference to a pending load, which then locks
        // the slots to evict itself.
        drop(entries);
    }

    fn is_expired(&self, succeeded_at: Instant) -> bool {
        self.config
            .retention
            .is_some_and(|retention| succeeded_at.elapsed() >= retention)
    }
}

impl<K, V, E> SingleFlightCache<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Returns the value for `key`, loading it with `loader` if necessary.
    ///
    /// If a load for `key` is currently running, or a previous load succeeded (and did not
    /// expire), the returned [`Lookup`] shares that result and `loader` is dropped without
    /// being called. Otherwise a new load is registered for `key`, which calls `loader`
    /// exactly once, outside of any lock, as soon as it is first driven.
    ///
    /// NOTE: This function itself is *not* `async`. The load is registered right away, and
    /// with [`spawn_loaders`](CacheConfig::spawn_loaders) it is also eagerly driven to
    /// completion on the current runtime, even if the returned handle is never awaited.
    ///
    /// # Errors
    ///
    /// Errors of the loader are passed through as-is to everyone waiting on that load. The
    /// failed load is evicted, so the next call for `key` retries.
    ///
    /// # Panics
    ///
    /// If the loader panics, its load is evicted as well, and the panic is propagated to the
    /// callers polling the returned handle.
    pub fn get<F, Fut>(&self, key: K, loader: F) -> Lookup<V, E>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let name = self.name();
        metric!(counter("caches.access") += 1, "cache" => name);

        let (load, replaced, entries) = {
            let mut slots = self.slots.lock();

            if let Some(entry) = slots.entries.get(&key) {
                match entry.state {
                    EntryState::InFlight => {
                        // A concurrent lookup was deduplicated.
                        metric!(counter("caches.channel.hit") += 1, "cache" => name);
                        return Lookup {
                            inner: entry.load.clone(),
                        };
                    }
                    EntryState::Succeeded(at) if !self.is_expired(at) => {
                        metric!(counter("caches.memory.hit") += 1, "cache" => name);
                        return Lookup {
                            inner: entry.load.clone(),
                        };
                    }
                    EntryState::Succeeded(_) => {
                        metric!(counter("caches.expired") += 1, "cache" => name);
                        tracing::trace!(cache = name, ?key, "Cached value expired");
                    }
                }
            }

            // A lookup is considered new if there is no usable entry. It will be replaced
            // by the next generation for this key.
            metric!(counter("caches.channel.miss") += 1, "cache" => name);

            let generation = slots.next_generation;
            slots.next_generation += 1;

            let load = self.create_load(key.clone(), generation, loader);
            let replaced = slots.entries.insert(
                key,
                Entry {
                    generation,
                    state: EntryState::InFlight,
                    load: load.clone(),
                },
            );
            (load, replaced, slots.entries.len())
        };
        drop(replaced);
        metric!(gauge("caches.entries") = entries as u64, "cache" => name);

        if self.config.spawn_loaders {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(load.clone().map(|_| ()));
            }
        }

        Lookup { inner: load }
    }

    /// Returns a handle to the running or succeeded load for `key`, without starting one.
    pub fn get_if_present(&self, key: &K) -> Option<Lookup<V, E>> {
        let slots = self.slots.lock();
        let entry = slots.entries.get(key)?;
        match entry.state {
            EntryState::Succeeded(at) if self.is_expired(at) => None,
            _ => Some(Lookup {
                inner: entry.load.clone(),
            }),
        }
    }

    /// Returns the status of the entry for `key`, if there is a usable one.
    pub fn status(&self, key: &K) -> Option<EntryStatus> {
        let slots = self.slots.lock();
        match slots.entries.get(key)?.state {
            EntryState::InFlight => Some(EntryStatus::InFlight),
            EntryState::Succeeded(at) if self.is_expired(at) => None,
            EntryState::Succeeded(_) => Some(EntryStatus::Succeeded),
        }
    }

    /// Removes the entry for `key`, returning whether there was one.
    ///
    /// A load that is currently running still resolves for the callers holding its
    /// [`Lookup`], but its result is not stored, and the next [`get`](Self::get) starts a new
    /// load.
    pub fn invalidate(&self, key: &K) -> bool {
        let (removed, entries) = {
            let mut slots = self.slots.lock();
            let removed = slots.entries.remove(key);
            (removed, slots.entries.len())
        };
        let Some(removed) = removed else {
            return false;
        };

        metric!(counter("caches.invalidated") += 1, "cache" => self.name());
        metric!(gauge("caches.entries") = entries as u64, "cache" => self.name());
        tracing::debug!(
            cache = self.name(),
            ?key,
            generation = removed.generation,
            "Invalidated entry"
        );
        drop(removed);
        true
    }

    /// Wraps the `loader` into a shareable load for one generation of `key`.
    ///
    /// The load settles its own entry: on success, the entry is marked as succeeded. On
    /// failure, the entry is removed *before* the error becomes visible to any waiter. Both
    /// only happen if the entry still belongs to this generation, so a late result never
    /// clobbers a newer entry.
    fn create_load<F, Fut>(&self, key: K, generation: u64, loader: F) -> SharedLoad<V, E>
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let slots = Arc::downgrade(&self.slots);
        let config = Arc::clone(&self.config);

        let evict_token = {
            let slots = slots.clone();
            let config = Arc::clone(&config);
            let key = key.clone();
            CallOnDrop::new(move || evict(&slots, &config, &key, generation))
        };

        async move {
            tracing::trace!(cache = config.name.as_str(), ?key, generation, "Starting load");

            let load = {
                let key = key.clone();
                async move { loader(key).await }
            };
            let loaded = AssertUnwindSafe(load).catch_unwind().await;
            match loaded {
                Ok(Ok(value)) => {
                    evict_token.disarm();
                    settle(&slots, &key, generation);
                    Ok(value)
                }
                Ok(Err(err)) => {
                    metric!(counter("caches.loader.failure") += 1, "cache" => &config.name);
                    // Drop the token first to evict from the map. This ensures that callers
                    // either get a load that will yield this error, or they start a new one.
                    drop(evict_token);
                    Err(err)
                }
                Err(panic) => {
                    drop(evict_token);
                    std::panic::resume_unwind(panic)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Marks the entry of `generation` as succeeded.
fn settle<K, V, E>(slots: &Weak<Mutex<Slots<K, V, E>>>, key: &K, generation: u64)
where
    K: Eq + Hash,
{
    let Some(slots) = slots.upgrade() else {
        return;
    };
    let mut slots = slots.lock();
    if let Some(entry) = slots.entries.get_mut(key) {
        if entry.generation == generation {
            entry.state = EntryState::Succeeded(Instant::now());
        }
    }
}

/// Removes the entry of `generation`, if it is still the current one for `key`.
fn evict<K, V, E>(
    slots: &Weak<Mutex<Slots<K, V, E>>>,
    config: &CacheConfig,
    key: &K,
    generation: u64,
) where
    K: Eq + Hash + fmt::Debug,
{
    let Some(slots) = slots.upgrade() else {
        return;
    };
    let (evicted, entries) = {
        let mut slots = slots.lock();
        let is_current = slots
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        let evicted = is_current.then(|| slots.entries.remove(key)).flatten();
        (evicted, slots.entries.len())
    };

    if evicted.is_some() {
        metric!(gauge("caches.entries") = entries as u64, "cache" => &config.name);
        tracing::debug!(
            cache = config.name.as_str(),
            ?key,
            generation,
            "Evicted failed load"
        );
    }
}
