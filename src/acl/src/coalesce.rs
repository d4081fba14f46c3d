//! Keyed request coalescing
//!
//! A [`Group`] guarantees at most one in-flight fetch per key. Callers that
//! arrive while a fetch is running share its outcome. Fetches run on their
//! own task, so they complete and populate caches even when every waiter
//! has gone away.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{AclError, Result};

/// Handle to the shared outcome of one coalesced fetch
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

type Calls<V> = Arc<Mutex<HashMap<String, SharedFetch<V>>>>;

/// Removes the key once the fetch task finishes, panics included.
struct Forget<V> {
    calls: Calls<V>,
    key: String,
}

impl<V> Drop for Forget<V> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.key);
    }
}

pub struct Group<V> {
    calls: Calls<V>,
}

impl<V> Group<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight fetch for `key`, or start one with `fetch`.
    ///
    /// `fetch` is only invoked when no fetch for `key` is running. Must be
    /// called from within a tokio runtime.
    pub fn do_chan<F, Fut>(&self, key: &str, fetch: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut calls = self.calls.lock();
        if let Some(call) = calls.get(key) {
            return call.clone();
        }

        let forget = Forget {
            calls: Arc::clone(&self.calls),
            key: key.to_string(),
        };
        let work = fetch();
        // the task cannot remove the key before it is inserted: removal
        // takes the lock held here
        let handle = tokio::spawn(async move {
            let _forget = forget;
            work.await
        });

        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(AclError::Internal(format!(
                    "coalesced fetch failed: {}",
                    join_err
                ))),
            }
        }
        .boxed()
        .shared();

        calls.insert(key.to_string(), shared.clone());
        shared
    }

    /// Whether a fetch for `key` is running.
    pub fn in_flight(&self, key: &str) -> bool {
        self.calls.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for Group<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for Group<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.calls.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_fetch() {
        let group: Arc<Group<usize>> = Arc::new(Group::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut waiters = Vec::new();
        for _ in 0..16 {
            let calls = Arc::clone(&calls);
            waiters.push(group.do_chan("token", move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }));
        }

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!group.in_flight("token"));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let group: Group<String> = Group::new();
        let a = group.do_chan("a", || async { Ok("a".to_string()) });
        let b = group.do_chan("b", || async { Ok("b".to_string()) });
        assert_eq!(group.len(), 2);
        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_key_released() {
        let group: Group<u8> = Group::new();
        let first = group.do_chan("k", || async { Err(AclError::NotFound) });
        let second = group.do_chan("k", || async { Ok(1) });

        assert_eq!(first.await, Err(AclError::NotFound));
        assert_eq!(second.await, Err(AclError::NotFound));

        tokio::task::yield_now().await;
        let third = group.do_chan("k", || async { Ok(7) });
        assert_eq!(third.await, Ok(7));
    }

    #[tokio::test]
    async fn test_fetch_completes_without_waiters() {
        let group: Group<u8> = Group::new();
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);

        drop(group.do_chan("k", move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(1, Ordering::SeqCst);
            Ok(0)
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_fetch_surfaces_internal_error() {
        let group: Group<u8> = Group::new();
        let waiter = group.do_chan("k", || async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(0)
        });
        assert!(matches!(waiter.await, Err(AclError::Internal(_))));
        assert!(!group.in_flight("k"));
    }
}
