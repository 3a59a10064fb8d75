//! Single-flight resolution of content ids into playable stream URLs.
//!
//! [`StreamResolutionCache`] keeps three pieces of state:
//!
//! - the warm cache, an in-memory `id -> URL` map,
//! - the in-flight table, one shared computation per id currently resolving,
//! - the cold cache, the JSON file the warm cache is mirrored into.
//!
//! Both in-memory maps sit behind one mutex that is only held for bookkeeping,
//! never across an extraction. Extractions run as their own Tokio tasks so they
//! keep going when the caller that started them goes away, unless the cache was
//! opened with [`CancelPolicy::CancelWhenAbandoned`].

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::ResolveError;
use crate::extract::{ExtractionMethod, SharedExtractor, StreamExtractor};
use crate::persist::ColdCache;
use crate::selection::select_best;
use crate::settings::{MethodPreference, SettingsStore};

type ResolveOutcome = Result<Url, ResolveError>;
type ComputationChannel = Shared<oneshot::Receiver<ResolveOutcome>>;

/// The cache wired to the real extractors and the persisted settings.
pub type DefaultStreamCache = StreamResolutionCache<SharedExtractor, Arc<SettingsStore>>;

/// What happens to a running resolution once nobody awaits it anymore.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Keep going and cache the result for the next caller.
    #[default]
    RunToCompletion,
    /// Abort the extraction when its last waiter is dropped. Resolutions
    /// started by [`StreamResolutionCache::prefetch`] are never aborted.
    CancelWhenAbandoned,
}

impl CancelPolicy {
    pub fn from_cancel_abandoned(cancel_abandoned: bool) -> Self {
        if cancel_abandoned {
            Self::CancelWhenAbandoned
        } else {
            Self::RunToCompletion
        }
    }
}

struct InFlight {
    channel: ComputationChannel,
    /// Distinguishes this computation from a later one for the same id.
    generation: u64,
    waiters: usize,
    /// Started or claimed by a prefetch.
    detached: bool,
    abort: AbortHandle,
}

#[derive(Default)]
struct CacheState {
    warm: HashMap<String, Url>,
    in_flight: HashMap<String, InFlight>,
    next_generation: u64,
}

struct Inner<E, P> {
    state: Mutex<CacheState>,
    /// Signalled whenever the in-flight table becomes empty.
    idle: Notify,
    cold: ColdCache,
    extractor: E,
    preference: P,
    policy: CancelPolicy,
}

pub struct StreamResolutionCache<E, P> {
    inner: Arc<Inner<E, P>>,
}

impl<E, P> Clone for StreamResolutionCache<E, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, P> fmt::Debug for StreamResolutionCache<E, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, running) = self
            .inner
            .state
            .try_lock()
            .map(|state| (state.warm.len(), state.in_flight.len()))
            .unwrap_or_default();
        f.debug_struct("StreamResolutionCache")
            .field("cache_file", &self.inner.cold.path())
            .field("entries", &entries)
            .field("in_flight", &running)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl<E, P> StreamResolutionCache<E, P>
where
    E: StreamExtractor + 'static,
    P: MethodPreference + 'static,
{
    /// Opens the cache backed by `cache_file`, loading whatever it already
    /// holds. A missing or corrupt file yields an empty cache.
    pub fn open(cache_file: impl Into<PathBuf>, extractor: E, preference: P) -> Self {
        Self::open_with_policy(cache_file, extractor, preference, CancelPolicy::default())
    }

    pub fn open_with_policy(
        cache_file: impl Into<PathBuf>,
        extractor: E,
        preference: P,
        policy: CancelPolicy,
    ) -> Self {
        let cold = ColdCache::new(cache_file);
        let warm = cold.load();
        debug!(
            path = %cold.path().display(),
            entries = warm.len(),
            ?policy,
            "opened stream resolution cache"
        );

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    warm,
                    ..CacheState::default()
                }),
                idle: Notify::new(),
                cold,
                extractor,
                preference,
                policy,
            }),
        }
    }

    /// Resolves `id` to a playable URL.
    ///
    /// Cached ids return without suspending. Otherwise the caller joins the
    /// running resolution for `id`, or starts one. Every caller joined to the
    /// same resolution receives the same outcome. Failures are not cached.
    pub async fn resolve(&self, id: &str) -> Result<Url, ResolveError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ResolveError::InvalidIdentifier);
        }

        let (channel, mut waiter) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(url) = state.warm.get(id) {
                trace!(%id, "stream cache hit");
                return Ok(url.clone());
            }

            let entry = match state.in_flight.entry(id.to_owned()) {
                Entry::Occupied(entry) => {
                    trace!(%id, "joining in-flight resolution");
                    entry.into_mut()
                }
                Entry::Vacant(entry) => {
                    state.next_generation += 1;
                    entry.insert(self.spawn_resolution(id, state.next_generation, false))
                }
            };
            entry.waiters += 1;

            let waiter = WaiterGuard {
                inner: Arc::clone(&self.inner),
                key: id.to_owned(),
                generation: entry.generation,
                settled: false,
            };
            (entry.channel.clone(), waiter)
        };

        let outcome = channel
            .await
            .unwrap_or_else(|_cancelled| Err(ResolveError::Interrupted(id.to_owned())));
        waiter.settled = true;
        outcome
    }

    /// Starts resolving every id that is neither cached nor already resolving,
    /// without waiting for any of them. Failures are logged and dropped.
    ///
    /// NOTE: This is deliberately not `async` so the work is spawned eagerly.
    /// It has to be called from within a Tokio runtime.
    pub fn prefetch<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut queued = 0usize;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() || state.warm.contains_key(id) {
                continue;
            }
            match state.in_flight.entry(id.to_owned()) {
                Entry::Occupied(entry) => entry.into_mut().detached = true,
                Entry::Vacant(entry) => {
                    state.next_generation += 1;
                    entry.insert(self.spawn_resolution(id, state.next_generation, true));
                    queued += 1;
                }
            }
        }
        debug!(queued, "queued stream prefetch");
    }

    /// Writes the warm cache to disk and waits for the write to finish.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.persist())
            .await
            .context("joining stream cache writer")?
    }

    /// Waits until no resolution is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn spawn_resolution(&self, id: &str, generation: u64, detached: bool) -> InFlight {
        let method = self.inner.preference.extraction_method();
        let (sender, receiver) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let token = ComputationToken {
            inner: Arc::clone(&self.inner),
            key: id.to_owned(),
            generation,
            finished: false,
        };

        let task = tokio::spawn(async move {
            let outcome = inner.compute(&token.key, method).await;
            // Settle the bookkeeping before broadcasting, so a caller either
            // joins this computation or sees its effect.
            token.finish(&outcome);
            if outcome.is_ok() {
                schedule_persist(&inner);
            }
            sender.send(outcome).ok();
        });

        InFlight {
            channel: receiver.shared(),
            generation,
            waiters: 0,
            detached,
            abort: task.abort_handle(),
        }
    }
}

impl<E, P> StreamResolutionCache<E, P> {
    /// Looks `id` up in the warm cache without resolving it.
    pub fn cached(&self, id: &str) -> Option<Url> {
        self.inner.state.lock().warm.get(id.trim()).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Url> {
        self.inner
            .state
            .lock()
            .warm
            .iter()
            .map(|(id, url)| (id.clone(), url.clone()))
            .collect()
    }

    /// Number of resolutions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().warm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_file(&self) -> &Path {
        self.inner.cold.path()
    }

    pub fn policy(&self) -> CancelPolicy {
        self.inner.policy
    }
}

impl<E: StreamExtractor, P> Inner<E, P> {
    async fn compute(&self, id: &str, method: ExtractionMethod) -> ResolveOutcome {
        debug!(%id, method = method.as_str(), "resolving stream");
        let candidates = match self.extractor.extract(id, method).await {
            Ok(candidates) => candidates,
            Err(err) => {
                let message = format!("{err:#}");
                debug!(%id, error = %message, "stream extraction failed");
                return Err(ResolveError::extraction(err));
            }
        };

        match select_best(&candidates) {
            Some(best) => {
                debug!(
                    %id,
                    resolution = best.resolution,
                    format_id = ?best.format_id,
                    "resolved stream"
                );
                Ok(best.url.clone())
            }
            None => {
                debug!(%id, candidates = candidates.len(), "no playable stream");
                Err(ResolveError::StreamNotFound(id.to_owned()))
            }
        }
    }
}

impl<E, P> Inner<E, P> {
    fn persist(&self) -> anyhow::Result<()> {
        self.cold.store_latest(|| {
            self.state
                .lock()
                .warm
                .iter()
                .map(|(id, url)| (id.clone(), url.to_string()))
                .collect()
        })
    }

    fn notify_if_idle(&self, state: &CacheState) {
        if state.in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Writes the cold cache in the background; the caller does not wait for it.
fn schedule_persist<E, P>(inner: &Arc<Inner<E, P>>)
where
    E: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    let inner = Arc::clone(inner);
    tokio::task::spawn_blocking(move || {
        if let Err(err) = inner.persist() {
            let message = format!("{err:#}");
            warn!(error = %message, "failed to persist stream cache");
        }
    });
}

/// Owned by the resolution task. Clears the in-flight entry when the task ends,
/// including when it panics or is aborted.
struct ComputationToken<E, P> {
    inner: Arc<Inner<E, P>>,
    key: String,
    generation: u64,
    finished: bool,
}

impl<E, P> ComputationToken<E, P> {
    fn finish(mut self, outcome: &ResolveOutcome) {
        let mut state = self.inner.state.lock();
        if let Ok(url) = outcome {
            state
                .warm
                .entry(self.key.clone())
                .or_insert_with(|| url.clone());
        }
        self.clear(&mut state);
        self.finished = true;
    }

    fn clear(&self, state: &mut CacheState) {
        if state
            .in_flight
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            state.in_flight.remove(&self.key);
            self.inner.notify_if_idle(state);
        }
    }
}

impl<E, P> Drop for ComputationToken<E, P> {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.inner.state.lock();
            self.clear(&mut state);
        }
    }
}

/// Held by each `resolve` call while it awaits a computation.
struct WaiterGuard<E, P> {
    inner: Arc<Inner<E, P>>,
    key: String,
    generation: u64,
    settled: bool,
}

impl<E, P> Drop for WaiterGuard<E, P> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let abandoned = match state.in_flight.get_mut(&self.key) {
            Some(entry) if entry.generation == self.generation => {
                entry.waiters = entry.waiters.saturating_sub(1);
                !self.settled
                    && entry.waiters == 0
                    && !entry.detached
                    && self.inner.policy == CancelPolicy::CancelWhenAbandoned
            }
            _ => false,
        };
        if !abandoned {
            return;
        }

        let removed = state.in_flight.remove(&self.key);
        self.inner.notify_if_idle(&state);
        drop(state);

        if let Some(entry) = removed {
            debug!(id = %self.key, "cancelling abandoned stream resolution");
            entry.abort.abort();
        }
    }
}
