use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{UserId, UserRecord, UserStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub user_id: UserId,
    pub session_key: Option<String>,
    pub username: Option<String>,
    pub scrobble_enabled: bool,
}

impl UserSession {
    pub fn from_record(user_id: UserId, record: UserRecord) -> Self {
        Self {
            user_id,
            session_key: non_empty(record.session_key),
            username: non_empty(record.username),
            scrobble_enabled: record.scrobble,
        }
    }

    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            session_key: self.session_key.clone().unwrap_or_default(),
            username: self.username.clone().unwrap_or_default(),
            scrobble: self.scrobble_enabled,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.session_key.is_some()
    }

    pub fn active_session_key(&self) -> Option<&str> {
        if !self.scrobble_enabled {
            return None;
        }
        self.session_key.as_deref()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

pub struct SessionCache {
    store: Arc<dyn UserStore>,
    entries: DashMap<UserId, UserSession>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self {
            store,
            entries: DashMap::new(),
        }
    }

    pub async fn get(&self, user_id: UserId) -> Result<UserSession, StoreError> {
        let cached = self.entries.get(&user_id).map(|entry| entry.clone());
        if let Some(session) = cached {
            return Ok(session);
        }
        let record = self.store.load_user_record(user_id).await?;
        let session = UserSession::from_record(user_id, record);
        debug!(user_id, linked = session.is_linked(), "loaded session from store");
        self.entries.insert(user_id, session.clone());
        Ok(session)
    }

    pub async fn put(&self, session: UserSession) -> Result<(), StoreError> {
        let user_id = session.user_id;
        let record = session.to_record();
        self.entries.insert(user_id, session);
        if let Err(err) = self.store.save_user_record(user_id, &record).await {
            self.invalidate(user_id);
            return Err(err);
        }
        Ok(())
    }

    pub fn invalidate(&self, user_id: UserId) {
        self.entries.remove(&user_id);
    }

    /// Cached row without touching the store.
    pub fn peek(&self, user_id: UserId) -> Option<UserSession> {
        self.entries.get(&user_id).map(|entry| entry.clone())
    }

    pub async fn link(
        &self,
        user_id: UserId,
        session_key: String,
        username: String,
    ) -> Result<UserSession, StoreError> {
        let session = UserSession {
            user_id,
            session_key: non_empty(session_key),
            username: non_empty(username),
            scrobble_enabled: true,
        };
        self.put(session.clone()).await?;
        Ok(session)
    }

    pub async fn unlink(&self, user_id: UserId) -> Result<UserSession, StoreError> {
        let mut session = self.get(user_id).await?;
        session.session_key = None;
        session.username = None;
        self.put(session.clone()).await?;
        Ok(session)
    }

    pub async fn set_scrobble_enabled(
        &self,
        user_id: UserId,
        enabled: bool,
    ) -> Result<UserSession, StoreError> {
        let mut session = self.get(user_id).await?;
        session.scrobble_enabled = enabled;
        self.put(session.clone()).await?;
        Ok(session)
    }

    /// Clears a session key the service reported as revoked. The cached row is
    /// evicted even when the store cannot be written.
    pub async fn revoke(&self, user_id: UserId) -> Result<(), StoreError> {
        self.invalidate(user_id);
        let mut record = self.store.load_user_record(user_id).await?;
        record.session_key.clear();
        let saved = self.store.save_user_record(user_id, &record).await;
        self.invalidate(user_id);
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn linked_record(key: &str) -> UserRecord {
        UserRecord {
            session_key: key.to_string(),
            username: "listener".to_string(),
            scrobble: true,
        }
    }

    #[test]
    fn empty_key_disables_scrobbling() {
        let session = UserSession::from_record(
            1,
            UserRecord {
                session_key: String::new(),
                username: String::new(),
                scrobble: true,
            },
        );
        assert!(!session.is_linked());
        assert_eq!(session.active_session_key(), None);

        let paused = UserSession::from_record(
            1,
            UserRecord {
                scrobble: false,
                ..linked_record("sk")
            },
        );
        assert_eq!(paused.active_session_key(), None);
    }

    #[tokio::test]
    async fn miss_loads_from_store_and_populates_cache() {
        let store = Arc::new(MemoryStore::new());
        store.save_user_record(5, &linked_record("sk-5")).await.unwrap();
        let cache = SessionCache::new(store.clone());

        assert!(cache.peek(5).is_none());
        let session = cache.get(5).await.unwrap();
        assert_eq!(session.active_session_key(), Some("sk-5"));
        assert_eq!(cache.peek(5), Some(session));
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone());
        assert!(!cache.get(3).await.unwrap().is_linked());

        store.save_user_record(3, &linked_record("sk-3")).await.unwrap();
        assert!(!cache.get(3).await.unwrap().is_linked());

        cache.invalidate(3);
        assert!(cache.get(3).await.unwrap().is_linked());
    }

    #[tokio::test]
    async fn put_writes_through_to_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone());

        cache
            .link(9, "sk-9".to_string(), "someone".to_string())
            .await
            .unwrap();
        assert_eq!(store.record(9).unwrap().session_key, "sk-9");

        cache.unlink(9).await.unwrap();
        let record = store.record(9).unwrap();
        assert!(record.session_key.is_empty());
        assert!(record.username.is_empty());
        assert!(!cache.get(9).await.unwrap().is_linked());
    }

    #[tokio::test]
    async fn unavailable_store_is_an_error_not_unlinked() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let cache = SessionCache::new(store.clone());

        assert!(matches!(cache.get(1).await, Err(StoreError::Unavailable(_))));
        assert!(cache.peek(1).is_none());
    }

    #[tokio::test]
    async fn failed_put_evicts_cached_row() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone());
        store.set_offline(true);

        let result = cache.link(2, "sk-2".to_string(), "u".to_string()).await;
        assert!(result.is_err());
        assert!(cache.peek(2).is_none());
    }

    #[tokio::test]
    async fn revoke_clears_key_and_keeps_username() {
        let store = Arc::new(MemoryStore::new());
        store.save_user_record(4, &linked_record("sk-4")).await.unwrap();
        let cache = SessionCache::new(store.clone());
        cache.get(4).await.unwrap();

        cache.revoke(4).await.unwrap();

        assert!(cache.peek(4).is_none());
        let record = store.record(4).unwrap();
        assert!(record.session_key.is_empty());
        assert_eq!(record.username, "listener");
        assert_eq!(cache.get(4).await.unwrap().active_session_key(), None);
    }

    #[tokio::test]
    async fn revoke_evicts_cached_key_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.save_user_record(4, &linked_record("sk-4")).await.unwrap();
        let cache = SessionCache::new(store.clone());
        cache.get(4).await.unwrap();
        store.set_offline(true);

        assert!(cache.revoke(4).await.is_err());
        assert!(cache.peek(4).is_none());
    }
}
