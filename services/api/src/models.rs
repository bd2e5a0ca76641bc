//! API Models
//!
//! Response bodies of the REST surface. They are projections of the core
//! conversation types, kept separate so the OpenAPI documentation generated
//! with `utoipa` does not leak internal fields.

use chrono::{DateTime, Utc};
use propscout_core::conversation::{Session, Turn};
use propscout_core::store::Favorite;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionResponse {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            owner_id: session.owner_id,
            created_at: session.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SourceResponse {
    #[schema(example = "https://maps.google.com/?cid=123")]
    pub uri: String,
    pub title: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TurnResponse {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(example = "model")]
    pub role: String,
    pub content: String,
    pub sources: Vec<SourceResponse>,
    /// Names of the tools the model invoked during this turn.
    pub tools: Vec<String>,
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Turn> for TurnResponse {
    fn from(turn: Turn) -> Self {
        Self {
            id: turn.id,
            role: turn.role.to_string(),
            content: turn.content,
            sources: turn
                .sources
                .into_iter()
                .map(|source| SourceResponse {
                    uri: source.uri,
                    title: source.title,
                })
                .collect(),
            tools: turn
                .tool_response
                .map(|marker| marker.tools)
                .unwrap_or_default(),
            interrupted: turn.interrupted,
            created_at: turn.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct FavoriteResponse {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = Option<String>, format = Uuid)]
    pub session_id: Option<Uuid>,
    #[schema(example = "listing-4411")]
    pub property_id: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Favorite> for FavoriteResponse {
    fn from(favorite: Favorite) -> Self {
        Self {
            id: favorite.id,
            session_id: favorite.session_id,
            property_id: favorite.property_id,
            name: favorite.name,
            latitude: favorite.position.map(|p| p.latitude),
            longitude: favorite.position.map(|p| p.longitude),
            note: favorite.note,
            created_at: favorite.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
