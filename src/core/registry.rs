//! In-memory progress registry for uploads that are still streaming.
//!
//! The ingestion sink is the only writer; progress observers only ever take
//! snapshots. Entries live exactly as long as the transfer does and are never
//! persisted.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("upload session {0} already exists")]
    DuplicateSession(String),
    #[error("upload session {0} not found")]
    NotFound(String),
}

/// Counters of a single upload, as seen by one observer at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub received_bytes: u64,
    pub total_bytes: u64,
}

impl SessionSnapshot {
    /// Percentage of the declared size received so far. An empty payload is
    /// complete by definition.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.received_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

#[derive(Debug)]
struct UploadSession {
    total_bytes: u64,
    received_bytes: u64,
}

/// Shared map from upload id to live transfer counters.
///
/// Cloning is cheap and every clone sees the same sessions. One coarse lock
/// guards the map; every critical section is a single hash lookup.
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    inner: Arc<RwLock<HashMap<String, UploadSession>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session. An existing session with the same id is left as is.
    pub async fn register(&self, id: &str, total_bytes: u64) -> Result<(), RegistryError> {
        let mut map = self.inner.write().await;
        if map.contains_key(id) {
            return Err(RegistryError::DuplicateSession(id.to_string()));
        }
        map.insert(
            id.to_string(),
            UploadSession {
                total_bytes,
                received_bytes: 0,
            },
        );
        Ok(())
    }

    /// Add `n` received bytes. Unknown ids are ignored: the writer may race
    /// with removal and that is not its problem.
    pub async fn advance(&self, id: &str, n: u64) {
        let mut map = self.inner.write().await;
        if let Some(session) = map.get_mut(id) {
            session.received_bytes = session.received_bytes.saturating_add(n);
        }
    }

    pub async fn snapshot(&self, id: &str) -> Result<SessionSnapshot, RegistryError> {
        let map = self.inner.read().await;
        map.get(id)
            .map(|session| SessionSnapshot {
                received_bytes: session.received_bytes,
                total_bytes: session.total_bytes,
            })
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn remove(&self, id: &str) {
        let mut map = self.inner.write().await;
        map.remove(id);
    }

    /// Remove from a synchronous context such as `Drop`. Takes the lock
    /// immediately when it is free, otherwise defers to a spawned task.
    pub fn remove_now(&self, id: &str) {
        if let Ok(mut map) = self.inner.try_write() {
            map.remove(id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.clone();
            let id = id.to_string();
            handle.spawn(async move { registry.remove(&id).await });
        }
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }

    pub async fn snapshot_all(&self) -> HashMap<String, SessionSnapshot> {
        let map = self.inner.read().await;
        map.iter()
            .map(|(id, session)| {
                (
                    id.clone(),
                    SessionSnapshot {
                        received_bytes: session.received_bytes,
                        total_bytes: session.total_bytes,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_advance_snapshot_remove() {
        let registry = ProgressRegistry::new();
        assert_eq!(registry.active_count().await, 0);

        registry.register("up-1", 1000).await.unwrap();
        registry.advance("up-1", 250).await;
        registry.advance("up-1", 250).await;

        let snap = registry.snapshot("up-1").await.unwrap();
        assert_eq!(snap.received_bytes, 500);
        assert_eq!(snap.total_bytes, 1000);
        assert_eq!(snap.percentage(), 50.0);

        registry.remove("up-1").await;
        assert_eq!(
            registry.snapshot("up-1").await,
            Err(RegistryError::NotFound("up-1".to_string()))
        );
        // Removing twice is fine.
        registry.remove("up-1").await;
    }

    #[tokio::test]
    async fn remove_now_from_sync_context() {
        let registry = ProgressRegistry::new();
        registry.register("free", 10).await.unwrap();
        registry.remove_now("free");
        assert!(registry.snapshot("free").await.is_err());

        // With the lock held elsewhere the removal is deferred, not lost.
        registry.register("busy", 10).await.unwrap();
        let reader = registry.inner.read().await;
        registry.remove_now("busy");
        drop(reader);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while registry.snapshot("busy").await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("deferred removal never ran");
    }

    #[tokio::test]
    async fn advance_on_missing_session_is_noop() {
        let registry = ProgressRegistry::new();
        registry.advance("ghost", 42).await;
        assert_eq!(registry.active_count().await, 0);
        assert!(registry.snapshot("ghost").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_register_keeps_original_counters() {
        let registry = ProgressRegistry::new();
        registry.register("up-1", 100).await.unwrap();
        registry.advance("up-1", 40).await;

        let err = registry.register("up-1", 9999).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSession("up-1".to_string()));

        let snap = registry.snapshot("up-1").await.unwrap();
        assert_eq!(snap.received_bytes, 40);
        assert_eq!(snap.total_bytes, 100);
    }

    #[tokio::test]
    async fn zero_total_reports_complete() {
        let snap = SessionSnapshot {
            received_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(snap.percentage(), 100.0);
    }

    #[tokio::test]
    async fn snapshot_all_lists_every_session() {
        let registry = ProgressRegistry::new();
        registry.register("a", 10).await.unwrap();
        registry.register("b", 20).await.unwrap();
        registry.advance("b", 5).await;

        let all = registry.snapshot_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"].received_bytes, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_do_not_lose_updates() {
        let registry = ProgressRegistry::new();
        registry.register("shared", 64 * 1000).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    registry.advance("shared", 10).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = registry.snapshot("shared").await.unwrap();
        assert_eq!(snap.received_bytes, 64 * 1000);
    }
}
