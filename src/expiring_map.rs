//! A map whose entries expire after a fixed time-to-live, used by the
//! PASSIVE session registry so disconnected sessions remain re-identifiable
//! for a while before they're dropped for good.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

type ExpiryHandler<V> = Arc<dyn Fn(V) + Send + Sync>;

struct Inner<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
    queue: Mutex<BinaryHeap<Reverse<(Instant, K)>>>,
    on_expire: Option<ExpiryHandler<V>>,
}

/// a `HashMap` whose entries are dropped automatically `ttl` after
/// insertion. A single background task drives the expiry; `put`, `get`,
/// `contains`, and `remove` are otherwise ordinary map operations.
pub struct ExpiringMap<K, V> {
    inner: Arc<Inner<K, V>>,
    ttl: Duration,
}

impl<K, V> Clone for ExpiringMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
        }
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// build a map with the given time-to-live and spawn its background
    /// expiry worker. No `expired` notification is raised.
    pub fn new(ttl: Duration) -> Self {
        Self::with_expiry_handler(ttl, None)
    }

    /// build a map that invokes `on_expire` with the value of each entry the
    /// background worker reaps. The handler runs on a detached task so a
    /// slow or panicking handler never stalls the worker; per the spec, its
    /// failures are logged and never propagate.
    pub fn with_expiry_handler(ttl: Duration, on_expire: Option<ExpiryHandler<V>>) -> Self {
        let inner = Arc::new(Inner {
            entries: Mutex::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            on_expire,
        });
        let map = Self { inner, ttl };
        map.spawn_worker();
        map
    }

    fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let next = {
                    let queue = inner.queue.lock().await;
                    queue.peek().map(|Reverse((deadline, _))| *deadline)
                };
                match next {
                    None => {
                        // nothing queued; poll again shortly rather than
                        // parking forever, since a concurrent `put` races
                        // this check.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Some(deadline) => {
                        sleep_until(deadline).await;
                        Self::reap_due(&inner, deadline).await;
                    }
                }
            }
        });
    }

    async fn reap_due(inner: &Inner<K, V>, now: Instant) {
        loop {
            let mut queue = inner.queue.lock().await;
            let due = match queue.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => queue.pop(),
                _ => None,
            };
            drop(queue);
            let Some(Reverse((deadline, key))) = due else {
                return;
            };
            let mut entries = inner.entries.lock().await;
            // a later `put` for the same key pushed a fresh queue entry;
            // this one is stale and the live entry isn't due yet.
            let due_value = match entries.get(&key) {
                Some((_, stored_deadline)) if *stored_deadline == deadline => {
                    entries.remove(&key).map(|(value, _)| value)
                }
                _ => None,
            };
            drop(entries);
            if let Some(value) = due_value {
                trace!("expiring map entry reaped");
                if let Some(handler) = inner.on_expire.clone() {
                    tokio::spawn(async move {
                        handler(value);
                    });
                }
            }
        }
    }

    /// insert `value` under `key`, resetting its time-to-live. A prior
    /// queue entry for the same key is left in place and tolerated as
    /// stale by the background worker.
    pub async fn put(&self, key: K, value: V) {
        let deadline = Instant::now() + self.ttl;
        {
            let mut entries = self.inner.entries.lock().await;
            entries.insert(key.clone(), (value, deadline));
        }
        let mut queue = self.inner.queue.lock().await;
        queue.push(Reverse((deadline, key)));
    }

    /// remove and return the value under `key`, if present and not yet
    /// expired.
    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.inner.entries.lock().await;
        entries.remove(key).map(|(value, _)| value)
    }

    /// `true` iff `key` is present and not yet expired
    pub async fn contains(&self, key: &K) -> bool {
        self.inner.entries.lock().await.contains_key(key)
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// clone out the value under `key`, if present and not yet expired
    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner
            .entries
            .lock()
            .await
            .get(key)
            .map(|(value, _)| value.clone())
    }
}

impl<K, V> std::fmt::Debug for ExpiringMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringMap").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_before_expiry() {
        let map: ExpiringMap<String, u32> = ExpiringMap::new(Duration::from_millis(200));
        map.put("a".to_string(), 1).await;
        assert_eq!(map.get(&"a".to_string()).await, Some(1));
        assert!(map.contains(&"a".to_string()).await);
    }

    #[tokio::test]
    async fn entry_is_gone_after_its_ttl_elapses() {
        let map: ExpiringMap<String, u32> = ExpiringMap::new(Duration::from_millis(50));
        map.put("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(map.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn re_putting_the_same_key_refreshes_its_ttl() {
        let map: ExpiringMap<String, u32> = ExpiringMap::new(Duration::from_millis(150));
        map.put("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        map.put("a".to_string(), 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(map.get(&"a".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn remove_takes_the_entry_out_immediately() {
        let map: ExpiringMap<String, u32> = ExpiringMap::new(Duration::from_secs(10));
        map.put("a".to_string(), 1).await;
        assert_eq!(map.remove(&"a".to_string()).await, Some(1));
        assert_eq!(map.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn expiry_fires_the_registered_handler_with_the_value() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let handler: ExpiryHandler<u32> = Arc::new(move |value| {
            let tx = tx.clone();
            let _ = tx.try_send(value);
        });
        let map: ExpiringMap<String, u32> =
            ExpiringMap::with_expiry_handler(Duration::from_millis(50), Some(handler));
        map.put("a".to_string(), 42).await;
        let expired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("handler did not fire in time")
            .expect("channel closed");
        assert_eq!(expired, 42);
    }
}
