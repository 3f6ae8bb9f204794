//! Session registry: maps session IDs to independently lockable state.
//!
//! The registry-level lock only guards the map itself and is never held while
//! a session is being worked on. Each session carries its own async mutex,
//! which the upload pipeline holds for its whole critical section so that
//! concurrent uploads to one session are serialized while different sessions
//! proceed in parallel.

use crate::session::SessionState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{MutexGuard, RwLock};
use tracing::{debug, info};

/// One session's state plus bookkeeping for eviction.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    state: tokio::sync::Mutex<SessionState>,
    last_seen: Mutex<Instant>,
}

impl SessionHandle {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: tokio::sync::Mutex::new(SessionState::new()),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enter the session's critical section.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.touch();
        self.state.lock().await
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Concurrency-safe mapping from session ID to session state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, creating default state on first access.
    ///
    /// Every call for the same ID returns the same instance until the session
    /// is removed or evicted.
    pub async fn get(&self, id: &str) -> Arc<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(id) {
            handle.touch();
            return Arc::clone(handle);
        }

        let mut sessions = self.sessions.write().await;
        let handle = sessions.entry(id.to_string()).or_insert_with(|| {
            debug!(session = %id, "Created session state");
            Arc::new(SessionHandle::new(id))
        });
        handle.touch();
        Arc::clone(handle)
    }

    /// Whether state exists for `id`, without creating it.
    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Forget a session entirely.
    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Sorted IDs of all live sessions.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop sessions idle for longer than `max_idle`.
    ///
    /// A session is kept if anyone still holds its handle or its state lock,
    /// so in-flight uploads are never orphaned. Returns the number evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, handle| {
            let busy = Arc::strong_count(handle) > 1 || handle.state.try_lock().is_err();
            let keep = busy || handle.idle_for() <= max_idle;
            if !keep {
                debug!(session = %id, "Evicting idle session");
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_creates_lazily_and_reuses_instance() {
        let registry = SessionRegistry::new();
        assert!(!registry.contains("alice").await);

        let a = registry.get("alice").await;
        let b = registry.get("alice").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), "alice");
        assert_eq!(a.lock().await.integrity_score(), 1.0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let registry = SessionRegistry::new();
        registry.get("a").await.lock().await.apply_penalty(0.5);
        assert_eq!(registry.get("b").await.lock().await.integrity_score(), 1.0);
        assert_eq!(registry.ids().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_other_session_not_blocked_by_held_lock() {
        let registry = SessionRegistry::new();
        let a = registry.get("a").await;
        let _guard = a.lock().await;

        let b = tokio::time::timeout(Duration::from_secs(1), async {
            let handle = registry.get("b").await;
            handle.lock().await.integrity_score()
        })
        .await;
        assert_eq!(b.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_remove_forgets_state() {
        let registry = SessionRegistry::new();
        registry.get("a").await.lock().await.apply_penalty(0.2);
        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        assert_eq!(registry.get("a").await.lock().await.integrity_score(), 1.0);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_held_sessions() {
        let registry = SessionRegistry::new();
        let held = registry.get("held").await;
        drop(registry.get("idle").await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let evicted = registry.evict_idle(Duration::from_millis(5)).await;
        assert_eq!(evicted, 1);
        assert!(registry.contains("held").await);
        assert!(!registry.contains("idle").await);
        drop(held);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_recent_sessions() {
        let registry = SessionRegistry::new();
        drop(registry.get("fresh").await);
        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 0);
        assert!(!registry.is_empty().await);
    }
}
