use super::{
    ConversationStore, Favorite, FavoritesStore, Lead, LeadDirectory, NewFavorite, StoreError,
    check_appendable,
};
use crate::conversation::{Session, Turn};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, Session>,
    turns: HashMap<Uuid, Vec<Turn>>,
    favorites: Vec<Favorite>,
    leads: Vec<Lead>,
}

/// Process-local store used in tests and for running without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leads(leads: Vec<Lead>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                leads,
                ..Inner::default()
            }),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_session(&self, owner_id: Option<String>) -> Result<Session, StoreError> {
        let session = Session::new(owner_id);
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id, session.clone());
        inner.turns.insert(session.id, Vec::new());
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.read().await.sessions.get(&session_id).cloned())
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.owner_id.as_deref() == Some(owner_id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn append_turn(&self, session_id: Uuid, turn: &Turn) -> Result<(), StoreError> {
        check_appendable(session_id, turn)?;
        let mut inner = self.inner.write().await;
        let turns = inner
            .turns
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound(session_id))?;
        turns.push(turn.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Vec<Turn>, StoreError> {
        self.inner
            .read()
            .await
            .turns
            .get(&session_id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(session_id))
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        inner.turns.remove(&session_id);
        Ok(inner.sessions.remove(&session_id).is_some())
    }
}

#[async_trait]
impl FavoritesStore for MemoryStore {
    async fn save_favorite(&self, favorite: NewFavorite) -> Result<Favorite, StoreError> {
        let saved = Favorite {
            id: Uuid::new_v4(),
            owner_id: favorite.owner_id,
            session_id: favorite.session_id,
            property_id: favorite.property_id,
            name: favorite.name,
            position: favorite.position,
            note: favorite.note,
            created_at: Utc::now(),
        };
        self.inner.write().await.favorites.push(saved.clone());
        Ok(saved)
    }

    async fn list_favorites(&self, owner_id: &str) -> Result<Vec<Favorite>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .favorites
            .iter()
            .filter(|f| f.owner_id.as_deref() == Some(owner_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LeadDirectory for MemoryStore {
    async fn find_leads(&self, query: &str, limit: usize) -> Result<Vec<Lead>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .leads
            .iter()
            .filter(|lead| lead.matches(query))
            .take(limit)
            .cloned()
            .collect())
    }
}
