//! Conversation Persistence
//!
//! Narrow async interfaces over the durable store. The live runtime only ever
//! appends final turns (through a `TurnWriter`); everything else is used by
//! the REST surface and by replay.

mod memory;
mod writer;

pub use memory::MemoryStore;
pub use writer::{PersistFailure, TurnWriter};

use crate::conversation::{Session, Turn};
use crate::map::Position;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("refusing to persist partial turn {0}")]
    PartialTurn(Uuid),
    #[error("turn {turn} belongs to session {actual}, not {expected}")]
    SessionMismatch {
        turn: Uuid,
        expected: Uuid,
        actual: Uuid,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_session(&self, owner_id: Option<String>) -> Result<Session, StoreError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError>;

    /// Sessions of `owner_id`, newest first.
    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Appends a final turn. Partial turns are rejected.
    async fn append_turn(&self, session_id: Uuid, turn: &Turn) -> Result<(), StoreError>;

    /// Final turns of a session in append order.
    async fn load_session(&self, session_id: Uuid) -> Result<Vec<Turn>, StoreError>;

    /// Deletes the session and its turns. Returns whether it existed.
    async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError>;
}

/// Validates a turn before it is appended to `session_id`.
pub fn check_appendable(session_id: Uuid, turn: &Turn) -> Result<(), StoreError> {
    if !turn.is_final {
        return Err(StoreError::PartialTurn(turn.id));
    }
    if turn.session_id != session_id {
        return Err(StoreError::SessionMismatch {
            turn: turn.id,
            expected: session_id,
            actual: turn.session_id,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub property_id: String,
    pub name: String,
    pub position: Option<Position>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFavorite {
    pub owner_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub property_id: String,
    pub name: String,
    pub position: Option<Position>,
    pub note: Option<String>,
}

#[async_trait]
pub trait FavoritesStore: Send + Sync {
    async fn save_favorite(&self, favorite: NewFavorite) -> Result<Favorite, StoreError>;

    async fn list_favorites(&self, owner_id: &str) -> Result<Vec<Favorite>, StoreError>;
}

/// A CRM contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub interest: Option<String>,
}

impl Lead {
    /// Case-insensitive substring match over the searchable fields.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        [
            Some(self.name.as_str()),
            self.email.as_deref(),
            self.phone.as_deref(),
            self.interest.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&query))
    }
}

#[async_trait]
pub trait LeadDirectory: Send + Sync {
    async fn find_leads(&self, query: &str, limit: usize) -> Result<Vec<Lead>, StoreError>;
}
