//! The server's two session registries: ACTIVE sessions that currently hold
//! an open frame transport, and PASSIVE sessions that have disconnected but
//! remain re-identifiable for a grace period. A single monitor serializes
//! the identification critical section so two concurrent reconnects can't
//! both claim the same `x-user-id`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::errors::{ServerError, WsError};
use crate::session::Session;

/// sessions currently holding an open frame transport, keyed by id
#[derive(Clone)]
pub struct ActiveRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl Default for ActiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `true` iff `id` is currently ACTIVE
    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// move `session` into the ACTIVE registry under its current id
    pub async fn insert(&self, session: Session) {
        let id = session.id().to_string();
        self.sessions.write().await.insert(id, session);
    }

    /// remove and return the session under `id`, if ACTIVE
    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.write().await.remove(id)
    }

    /// run `f` against the ACTIVE session `id`, if present. `f` must be
    /// synchronous — never hold this lock across an `await`.
    pub async fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, WsError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or(WsError::Server(ServerError::ClientNotFound))?;
        Ok(f(session))
    }

    /// clone out the outbound channel for `id`, without holding the
    /// registry lock across the caller's subsequent `send`
    pub async fn outbound_sender(
        &self,
        id: &str,
    ) -> Result<tokio::sync::mpsc::Sender<crate::session::Outbound>, WsError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or(WsError::Server(ServerError::ClientNotFound))?;
        session
            .outbound()
            .ok_or(WsError::Server(ServerError::ClientNotConnected))
    }

    /// every currently ACTIVE session id
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// a read-only snapshot of the ACTIVE session `id`, if present
    pub async fn info(&self, id: &str) -> Option<crate::session::ClientInfo> {
        self.sessions.read().await.get(id).map(crate::session::ClientInfo::from)
    }

    /// number of currently ACTIVE sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// backing store for [`PassiveRegistry`]: either a plain mapping that
/// retains entries indefinitely, or an expiring one that drops them
/// `passive_client_lifetime` after they're put.
#[derive(Clone)]
enum PassiveBacking {
    Plain(Arc<RwLock<HashMap<String, Session>>>),
    Expiring(crate::expiring_map::ExpiringMap<String, Session>),
}

/// sessions that have disconnected but remain re-identifiable. Whether
/// entries expire depends on `remove_passive_clients_after_expiration`; see
/// [`PassiveRegistry::new`] vs [`PassiveRegistry::new_expiring`].
#[derive(Clone)]
pub struct PassiveRegistry {
    backing: PassiveBacking,
}

impl PassiveRegistry {
    /// a plain mapping: sessions are retained until explicitly reclaimed or
    /// removed, with no time-to-live
    pub fn new() -> Self {
        Self {
            backing: PassiveBacking::Plain(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    /// an expiring mapping: sessions are dropped `retention` after being put,
    /// unless reclaimed first
    pub fn new_expiring(retention: Duration) -> Self {
        Self {
            backing: PassiveBacking::Expiring(crate::expiring_map::ExpiringMap::new(retention)),
        }
    }

    /// an expiring mapping that invokes `on_expire` with each session the
    /// background worker drops after `retention` elapses
    pub fn new_expiring_with_handler(
        retention: Duration,
        on_expire: Option<std::sync::Arc<dyn Fn(Session) + Send + Sync>>,
    ) -> Self {
        Self {
            backing: PassiveBacking::Expiring(crate::expiring_map::ExpiringMap::with_expiry_handler(
                retention, on_expire,
            )),
        }
    }

    /// retain `session` for reconnection
    pub async fn put(&self, session: Session) {
        let id = session.id().to_string();
        match &self.backing {
            PassiveBacking::Plain(map) => {
                map.write().await.insert(id, session);
            }
            PassiveBacking::Expiring(map) => map.put(id, session).await,
        }
    }

    /// take the session back out for reconnection, if it hasn't expired
    pub async fn take(&self, id: &str) -> Option<Session> {
        match &self.backing {
            PassiveBacking::Plain(map) => map.write().await.remove(id),
            PassiveBacking::Expiring(map) => map.remove(&id.to_string()).await,
        }
    }

    /// `true` iff `id` is retained and not yet expired
    pub async fn contains(&self, id: &str) -> bool {
        match &self.backing {
            PassiveBacking::Plain(map) => map.read().await.contains_key(id),
            PassiveBacking::Expiring(map) => map.contains(&id.to_string()).await,
        }
    }
}

impl Default for PassiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// serializes the identification critical section described in the
/// session-registry design: read ACTIVE, read PASSIVE, then commit to one
/// registry or the other, all under one lock so two reconnects can't both
/// win the same id.
#[derive(Clone, Default)]
pub struct IdentificationMonitor {
    lock: Arc<Mutex<()>>,
}

impl IdentificationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// run `f` with the identification critical section held
    pub async fn locked<R, Fut>(&self, f: impl FnOnce() -> Fut) -> R
    where
        Fut: std::future::Future<Output = R>,
    {
        let _guard = self.lock.lock().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_registry_insert_and_remove() {
        let registry = ActiveRegistry::new();
        let session = Session::new("127.0.0.1:1");
        let id = session.id().to_string();
        registry.insert(session).await;
        assert!(registry.contains(&id).await);
        assert_eq!(registry.count().await, 1);
        let removed = registry.remove(&id).await;
        assert!(removed.is_some());
        assert!(!registry.contains(&id).await);
    }

    #[tokio::test]
    async fn passive_registry_put_then_take() {
        let registry = PassiveRegistry::new_expiring(Duration::from_secs(5));
        let mut session = Session::new("127.0.0.1:1");
        session.update_id("user-1").unwrap();
        registry.put(session).await;
        assert!(registry.contains("user-1").await);
        let taken = registry.take("user-1").await;
        assert!(taken.is_some());
        assert!(!registry.contains("user-1").await);
    }

    #[tokio::test]
    async fn identification_monitor_serializes_access() {
        let monitor = IdentificationMonitor::new();
        let result = monitor.locked(|| async { 1 + 1 }).await;
        assert_eq!(result, 2);
    }
}
