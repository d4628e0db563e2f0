//! Keyed connection cache with single-flight establishment.
//!
//! One slot per resource id. A slot is either empty, holds a live handle,
//! or holds an in-flight establishment attempt that every concurrent
//! caller waits on. Failures are never cached: the slot goes back to
//! empty and the next caller starts a fresh attempt.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use opshub_core::{Error, ResourceId, Result};

/// A cached connection handle.
///
/// Handles are cheap clones of a shared inner state (an `Arc` in
/// practice), so the cache hands out copies freely. `close` must be
/// idempotent: the cache may race an explicit eviction with a health
/// probe and both paths may end up closing the same handle.
pub trait ManagedConn: Clone + Send + Sync + 'static {
    /// Cheap liveness probe. Must not block on remote round trips that
    /// can stall; a local check of the transport state is enough.
    fn is_alive(&self) -> impl Future<Output = bool> + Send;

    /// Tear down the underlying transport. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

enum SlotState<T> {
    Idle,
    /// An establishment attempt is in flight. Waiters subscribe to the
    /// channel and receive the attempt's outcome; if the sender is
    /// dropped without publishing (the attempt was cancelled), waiters
    /// go back to the slot and retry.
    Pending(watch::Receiver<Option<Result<T>>>),
    Ready(T),
}

struct Slot<T> {
    /// Bumped every time the slot's state is replaced. Lets a caller
    /// that found a dead handle avoid evicting a newer, healthy one
    /// installed while it was probing.
    generation: u64,
    state: SlotState<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            state: SlotState::Idle,
        }
    }
}

/// Resets an abandoned attempt's slot back to idle.
///
/// Armed for the duration of the factory call inside [`ConnCache::get_with`].
/// If the caller's future is dropped mid-establishment, the drop handler
/// clears the `Pending` marker so waiters are not wedged forever.
struct AttemptGuard<T> {
    slot: Arc<Mutex<Slot<T>>>,
    armed: bool,
}

impl<T> AttemptGuard<T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for AttemptGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.slot.lock();
        if matches!(slot.state, SlotState::Pending(_)) {
            slot.generation += 1;
            slot.state = SlotState::Idle;
        }
    }
}

/// What `get_with` decided to do after inspecting the slot.
enum Action<T> {
    Use(T, u64),
    Wait(watch::Receiver<Option<Result<T>>>),
    Establish(watch::Sender<Option<Result<T>>>),
}

/// Concurrent map of resource id to connection slot.
///
/// All state transitions happen under a per-slot mutex that is never
/// held across an await point; establishment itself runs outside the
/// lock with only a `Pending` marker in place.
pub struct ConnCache<T: ManagedConn> {
    slots: DashMap<ResourceId, Arc<Mutex<Slot<T>>>>,
}

impl<T: ManagedConn> Default for ConnCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ManagedConn> ConnCache<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Return the cached handle for `id`, establishing one with
    /// `establish` if the slot is empty or its handle turned out dead.
    ///
    /// Concurrent callers for the same id during establishment all wait
    /// on the single in-flight attempt and observe its outcome, success
    /// or failure alike. A failed attempt leaves the slot empty, so a
    /// later call retries from scratch.
    pub async fn get_with<F, Fut>(&self, id: ResourceId, establish: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>> + Send,
    {
        loop {
            let slot = Arc::clone(&self.slots.entry(id).or_default());

            let action = {
                let mut guard = slot.lock();
                match &guard.state {
                    SlotState::Ready(handle) => Action::Use(handle.clone(), guard.generation),
                    SlotState::Pending(rx) => Action::Wait(rx.clone()),
                    SlotState::Idle => {
                        let (tx, rx) = watch::channel(None);
                        guard.generation += 1;
                        guard.state = SlotState::Pending(rx);
                        Action::Establish(tx)
                    }
                }
            };

            match action {
                Action::Use(handle, generation) => {
                    if handle.is_alive().await {
                        return Ok(handle);
                    }
                    debug!(resource_id = id, "Cached handle is dead, evicting");
                    {
                        let mut guard = slot.lock();
                        // Only clear the slot if nobody replaced the
                        // handle while we were probing.
                        if guard.generation == generation {
                            guard.generation += 1;
                            guard.state = SlotState::Idle;
                        }
                    }
                    handle.close().await;
                    // Loop around and establish (or join a newer attempt).
                }
                Action::Wait(mut rx) => {
                    let outcome = loop {
                        let published = rx.borrow_and_update().clone();
                        if let Some(result) = published {
                            break Some(result);
                        }
                        if rx.changed().await.is_err() {
                            // Attempt abandoned without an outcome.
                            break None;
                        }
                    };
                    match outcome {
                        Some(result) => return result,
                        None => continue,
                    }
                }
                Action::Establish(tx) => {
                    let guard = AttemptGuard {
                        slot: Arc::clone(&slot),
                        armed: true,
                    };
                    let result = establish().await;
                    {
                        let mut slot = slot.lock();
                        slot.generation += 1;
                        slot.state = match &result {
                            Ok(handle) => SlotState::Ready(handle.clone()),
                            Err(error) => {
                                warn!(resource_id = id, %error, "Connection establishment failed");
                                SlotState::Idle
                            }
                        };
                    }
                    guard.disarm();
                    // Waiters that subscribed while we were dialing get
                    // the same outcome we return.
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Cached handle for `id` without establishing, or `NotFound`.
    ///
    /// Pending attempts do not count: only a `Ready` handle is returned.
    pub fn peek(&self, id: ResourceId) -> Result<T> {
        let slot = self.slots.get(&id).ok_or(Error::NotFound(id))?;
        let guard = slot.lock();
        match &guard.state {
            SlotState::Ready(handle) => Ok(handle.clone()),
            _ => Err(Error::NotFound(id)),
        }
    }

    /// Remove the slot for `id` and close its handle, if any.
    ///
    /// An in-flight attempt is detached rather than interrupted: its
    /// waiters still receive the outcome, but the result is not cached
    /// under this id anymore.
    pub async fn evict(&self, id: ResourceId) {
        if let Some((_, slot)) = self.slots.remove(&id) {
            let state = {
                let mut guard = slot.lock();
                std::mem::replace(&mut guard.state, SlotState::Idle)
            };
            if let SlotState::Ready(handle) = state {
                debug!(resource_id = id, "Evicting connection");
                handle.close().await;
            }
        }
    }

    /// Close every cached handle and clear the map.
    pub async fn drain(&self) {
        let ids: Vec<ResourceId> = self.slots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.evict(id).await;
        }
    }

    /// Number of slots currently holding a live handle.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.lock().state, SlotState::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TestConn {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl TestConn {
        fn new() -> Self {
            Self {
                alive: Arc::new(AtomicBool::new(true)),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ManagedConn for TestConn {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn get_with_reuses_live_handle() {
        let cache = ConnCache::new();
        let dials = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let dials = Arc::clone(&dials);
            cache
                .get_with(7, move || {
                    let dials = Arc::clone(&dials);
                    async move {
                        dials.fetch_add(1, Ordering::SeqCst);
                        Ok(TestConn::new())
                    }
                })
                .await
                .unwrap();
        }

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn dead_handle_is_replaced() {
        let cache = ConnCache::new();

        let first = cache
            .get_with(1, || async { Ok(TestConn::new()) })
            .await
            .unwrap();
        first.alive.store(false, Ordering::SeqCst);

        let second = cache
            .get_with(1, || async { Ok(TestConn::new()) })
            .await
            .unwrap();
        assert!(second.alive.load(Ordering::SeqCst));
        // The dead handle was closed exactly once during replacement.
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let cache: ConnCache<TestConn> = ConnCache::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let attempts = Arc::clone(&attempts);
            let result = cache
                .get_with(2, move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(Error::transport(2, "refused"))
                    }
                })
                .await;
            assert!(result.is_err());
        }

        // Both calls dialed: the failure never occupied the slot.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn evict_closes_and_forgets() {
        let cache = ConnCache::new();
        let handle = cache
            .get_with(3, || async { Ok(TestConn::new()) })
            .await
            .unwrap();

        cache.evict(3).await;
        assert_eq!(handle.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.peek(3), Err(Error::NotFound(3))));

        // Evicting an absent id is a no-op.
        cache.evict(3).await;
        assert_eq!(handle.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peek_does_not_establish() {
        let cache: ConnCache<TestConn> = ConnCache::new();
        assert!(matches!(cache.peek(9), Err(Error::NotFound(9))));
    }
}
