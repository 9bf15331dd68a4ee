//! Async bounded pool for long-lived connection objects.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

struct IdleEntry<T> {
    value: T,
    since: Instant,
}

struct AsyncPoolState<T> {
    idle: Vec<IdleEntry<T>>,
    closed: bool,
}

pub type FactoryFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// An async bounded pool. Values are created lazily by the factory, returned
/// on drop of the guard, and evicted once they have sat idle past `max_idle`.
pub struct AsyncPool<T, E> {
    max: usize,
    max_idle: Option<Duration>,
    factory: Box<dyn Fn() -> FactoryFuture<T, E> + Send + Sync>,
    state: Mutex<AsyncPoolState<T>>,
    available: Notify,
    live: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError<E> {
    Timeout,
    Closed,
    Create(E),
}

/// A pooled async value that returns to the pool on drop.
pub struct AsyncPooled<T, E> {
    pool: Arc<AsyncPool<T, E>>,
    value: Option<T>,
}

impl<T, E> AsyncPool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut>(max: usize, max_idle: Option<Duration>, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let factory = Box::new(move || Box::pin(factory()) as FactoryFuture<T, E>);
        Arc::new(Self {
            max: max.max(1),
            max_idle,
            factory,
            state: Mutex::new(AsyncPoolState {
                idle: Vec::new(),
                closed: false,
            }),
            available: Notify::new(),
            live: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<AsyncPooled<T, E>, AcquireError<E>> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let (item, expired) = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(AcquireError::Closed);
                }
                let expired = self.take_expired(&mut state);
                (state.idle.pop().map(|entry| entry.value), expired)
            };
            self.forget(expired);
            if let Some(item) = item {
                return Ok(AsyncPooled {
                    pool: Arc::clone(self),
                    value: Some(item),
                });
            }
            if let Some(reservation) = self.try_reserve() {
                let item = (self.factory)().await.map_err(AcquireError::Create)?;
                reservation.fill();
                return Ok(AsyncPooled {
                    pool: Arc::clone(self),
                    value: Some(item),
                });
            }

            match deadline {
                None => self.available.notified().await,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    tokio::select! {
                        _ = self.available.notified() => {},
                        _ = sleep(limit - now) => return Err(AcquireError::Timeout),
                    }
                }
            }
        }
    }

    /// Drops idle values older than `max_idle` and returns how many went.
    pub fn evict_idle(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            self.take_expired(&mut state)
        };
        let count = expired.len();
        self.forget(expired);
        count
    }

    /// Drops every idle value and refuses further acquires. Values checked
    /// out at the time of the call are dropped when they come back.
    pub fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.forget(drained.into_iter().map(|entry| entry.value).collect());
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Values currently alive, idle or checked out.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn try_reserve(&self) -> Option<Reservation<'_, T, E>> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.max).then_some(live + 1)
            })
            .ok()
            .map(|_| Reservation {
                pool: self,
                filled: false,
            })
    }

    fn take_expired(&self, state: &mut AsyncPoolState<T>) -> Vec<T> {
        let Some(max_idle) = self.max_idle else {
            return Vec::new();
        };
        let now = Instant::now();
        let (expired, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|entry| now.duration_since(entry.since) > max_idle);
        state.idle = fresh;
        expired.into_iter().map(|entry| entry.value).collect()
    }

    // Values are dropped outside the state lock; closing a connection may
    // take a moment.
    fn forget(&self, values: Vec<T>) {
        if values.is_empty() {
            return;
        }
        self.live.fetch_sub(values.len(), Ordering::SeqCst);
        drop(values);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

/// A slot counted in `live` while its value is being created. Dropping it
/// unfilled (a failed or cancelled create) gives the slot back.
struct Reservation<'a, T, E> {
    pool: &'a AsyncPool<T, E>,
    filled: bool,
}

impl<T, E> Reservation<'_, T, E> {
    fn fill(mut self) {
        self.filled = true;
    }
}

impl<T, E> Drop for Reservation<'_, T, E> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.live.fetch_sub(1, Ordering::SeqCst);
            self.pool.available.notify_one();
        }
    }
}

impl<T, E> AsyncPooled<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Drops the value instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T, E> std::ops::Deref for AsyncPooled<T, E> {
    type Target = T;

    fn deref(&self) -> &T {
        // The value is only taken by `discard` (which consumes the guard)
        // and by `drop`.
        match self.value.as_ref() {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T, E> Drop for AsyncPooled<T, E> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            release_into(&self.pool, item);
        }
    }
}

// Lives outside the bounded impl block so `Drop` can call it.
fn release_into<T, E>(pool: &AsyncPool<T, E>, item: T) {
    let mut state = pool.state.lock();
    if state.closed {
        drop(state);
        pool.live.fetch_sub(1, Ordering::SeqCst);
        drop(item);
        pool.available.notify_one();
        return;
    }
    state.idle.push(IdleEntry {
        value: item,
        since: Instant::now(),
    });
    drop(state);
    pool.available.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_pool(max: usize, max_idle: Option<Duration>) -> Arc<AsyncPool<usize, String>> {
        let next = Arc::new(AtomicUsize::new(0));
        AsyncPool::new(max, max_idle, move || {
            let next = Arc::clone(&next);
            async move { Ok::<_, String>(next.fetch_add(1, Ordering::SeqCst)) }
        })
    }

    #[tokio::test]
    async fn async_pool_reuses_connections() {
        let pool = counting_pool(2, None);
        let first = pool.acquire(None).await.expect("first");
        let second = pool.acquire(None).await.expect("second");
        assert_eq!(pool.live_count(), 2);
        drop(first);
        assert_eq!(pool.idle_count(), 1);
        drop(second);
        assert_eq!(pool.idle_count(), 2);
        let again = pool.acquire(None).await.expect("again");
        assert!(*again < 2);
        assert_eq!(pool.live_count(), 2);
    }

    #[tokio::test]
    async fn async_pool_timeout() {
        let pool = counting_pool(1, None);
        let _guard = pool.acquire(None).await.expect("guard");
        let result = pool.acquire(Some(Duration::from_millis(5))).await;
        assert_eq!(result.err(), Some(AcquireError::Timeout));
    }

    #[tokio::test]
    async fn async_pool_waiter_wakes_on_release() {
        let pool = counting_pool(1, None);
        let guard = pool.acquire(None).await.expect("guard");
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Some(Duration::from_secs(5))).await.map(|v| *v) })
        };
        tokio::task::yield_now().await;
        drop(guard);
        let value = waiter.await.expect("join").expect("acquired");
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn async_pool_discard_allows_recreate() {
        let pool = counting_pool(1, None);
        let guard = pool.acquire(None).await.expect("guard");
        guard.discard();
        assert_eq!(pool.live_count(), 0);
        let next = pool.acquire(Some(Duration::from_millis(10))).await.expect("next");
        assert_eq!(*next, 1);
    }

    #[tokio::test]
    async fn async_pool_create_failure_frees_slot() {
        let pool: Arc<AsyncPool<usize, String>> =
            AsyncPool::new(1, None, || async { Err("refused".to_string()) });
        let result = pool.acquire(None).await;
        assert_eq!(result.err(), Some(AcquireError::Create("refused".to_string())));
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn async_pool_cancelled_create_frees_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool: Arc<AsyncPool<usize, String>> = {
            let calls = Arc::clone(&calls);
            AsyncPool::new(1, None, move || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        std::future::pending::<()>().await;
                    }
                    Ok(call)
                }
            })
        };
        let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.acquire(None)).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.live_count(), 0);

        let next = pool
            .acquire(Some(Duration::from_millis(10)))
            .await
            .expect("slot was returned");
        assert_eq!(*next, 1);
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn async_pool_evicts_stale_idle_values() {
        let pool = counting_pool(2, Some(Duration::from_secs(30)));
        let guard = pool.acquire(None).await.expect("guard");
        drop(guard);
        assert_eq!(pool.idle_count(), 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.live_count(), 0);
        let fresh = pool.acquire(None).await.expect("fresh");
        assert_eq!(*fresh, 1);
    }

    #[tokio::test]
    async fn async_pool_close_rejects_and_drains() {
        let pool = counting_pool(2, None);
        let held = pool.acquire(None).await.expect("held");
        let idle = pool.acquire(None).await.expect("idle");
        drop(idle);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.acquire(None).await.err(), Some(AcquireError::Closed));
        drop(held);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }
}
