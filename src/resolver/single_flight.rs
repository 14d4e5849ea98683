//! In-flight call deduplication
//!
//! The first caller for a key (the leader) starts the upstream work on its own
//! task and registers a shared handle to it; concurrent callers for the same
//! key await that handle instead of starting their own. The registration is
//! removed when the work finishes, so the next caller after completion starts
//! fresh (and normally finds the result in the cache).
//!
//! Each waiter bounds its own wait with a deadline. A waiter giving up,
//! including the leader, never cancels the shared work.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::{Error, Result};

type SharedCall<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

struct Flight<V> {
    id: u64,
    call: SharedCall<V>,
}

/// Registry of in-flight calls keyed by `K`
pub struct SingleFlight<K, V> {
    calls: Arc<DashMap<K, Flight<V>>>,
    next_id: AtomicU64,
}

/// How a caller took part in a flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the upstream work
    Leader,
    /// Joined work started by another caller
    Follower,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Calls currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    /// Join the flight for `key`, starting it with `work` if none is running
    ///
    /// # Errors
    ///
    /// Returns the shared work's error, or [`Error::DeadlineExceeded`] when
    /// `deadline` passes first.
    pub async fn run<F, Fut>(&self, key: K, deadline: Instant, work: F) -> Result<(V, Role)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let started = Instant::now();
        let (call, role) = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().call.clone(), Role::Follower),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let call = self.launch(key, id, work());
                entry.insert(Flight {
                    id,
                    call: call.clone(),
                });
                (call, Role::Leader)
            }
        };

        match timeout_at(deadline, call).await {
            Ok(Ok(value)) => Ok((value, role)),
            Ok(Err(shared)) => Err(Error::from_shared(&shared)),
            Err(_) => {
                debug!(?role, "Gave up waiting for in-flight call");
                Err(Error::DeadlineExceeded(started.elapsed()))
            }
        }
    }

    fn launch<Fut>(&self, key: K, id: u64, work: Fut) -> SharedCall<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        let handle = tokio::spawn(async move {
            let result = work.await;
            calls.remove_if(&key, |_, flight| flight.id == id);
            result.map_err(Arc::new)
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "In-flight call task failed");
                    Err(Arc::new(Error::Internal(format!("in-flight call aborted: {e}"))))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_call() {
        let flights = Arc::new(SingleFlight::<&'static str, u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                flights
                    .run("q", far(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for task in tasks {
            let (value, role) = task.await.unwrap().unwrap();
            assert_eq!(value, 42);
            if role == Role::Leader {
                leaders += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_reach_every_waiter() {
        let flights = Arc::new(SingleFlight::<u8, u32>::new());
        let follower = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                flights.run(1, far(), || async { Ok(0) }).await
            })
        };

        let leader = flights
            .run(1, far(), || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(Error::dependency("rerank", "boom"))
            })
            .await;

        assert!(matches!(leader, Err(Error::DependencyFailure { .. })));
        assert!(matches!(
            follower.await.unwrap(),
            Err(Error::DependencyFailure { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_timeout_does_not_cancel_the_call() {
        let flights = Arc::new(SingleFlight::<u8, u32>::new());
        let finished = Arc::new(AtomicU32::new(0));

        let marker = Arc::clone(&finished);
        let result = flights
            .run(1, Instant::now() + Duration::from_millis(10), move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                marker.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert!(matches!(result, Err(Error::DeadlineExceeded(_))));
        assert_eq!(flights.in_flight(), 1);

        // A later caller joins the still-running call
        let (value, role) = flights.run(1, far(), || async { Ok(0) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(role, Role::Follower);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_flights_are_not_reused() {
        let flights = SingleFlight::<u8, u32>::new();
        let (first, _) = flights.run(1, far(), || async { Ok(1) }).await.unwrap();
        let (second, role) = flights.run(1, far(), || async { Ok(2) }).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(role, Role::Leader);
    }
}
