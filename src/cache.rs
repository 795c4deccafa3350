//! Fast session cache -- a TTL'd projection of the durable session row.
//!
//! Never authoritative. Writers update the durable store first and refresh the
//! cache afterwards; readers that make correctness decisions go to the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::session::{Session, SessionId};

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get(&self, id: SessionId) -> Result<Option<Session>>;
    async fn set(&self, session: &Session, ttl: Duration) -> Result<()>;
    async fn delete(&self, id: SessionId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

/// In-process cache with per-entry expiry. Expired entries are dropped lazily
/// on read and in bulk by [`MemoryCache::evict_expired`].
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<SessionId, (Session, Instant)>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry past its deadline. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, deadline)| *deadline > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn get(&self, id: SessionId) -> Result<Option<Session>> {
        {
            let entries = self.entries.read().await;
            match entries.get(&id) {
                None => return Ok(None),
                Some((session, deadline)) if *deadline > Instant::now() => {
                    return Ok(Some(session.clone()))
                }
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(&id);
        Ok(None)
    }

    async fn set(&self, session: &Session, ttl: Duration) -> Result<()> {
        let deadline = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(session.id, (session.clone(), deadline));
        Ok(())
    }

    async fn delete(&self, id: SessionId) -> Result<()> {
        self.entries.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeviceMeta;

    fn session() -> Session {
        Session::pending("aa:bb:cc:dd:ee:ff".parse().unwrap(), None, DeviceMeta::default())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        let s = session();
        cache.set(&s, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(s.id).await.unwrap().unwrap().id, s.id);

        cache.delete(s.id).await.unwrap();
        assert!(cache.get(s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let cache = MemoryCache::new();
        let s = session();
        cache.set(&s, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(s.id).await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_expired_keeps_live_entries() {
        let cache = MemoryCache::new();
        let short = session();
        let long = session();
        cache.set(&short, Duration::from_millis(5)).await.unwrap();
        cache.set(&long, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(long.id).await.unwrap().is_some());
    }
}
