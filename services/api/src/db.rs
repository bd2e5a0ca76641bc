//! Data Access Layer
//!
//! PostgreSQL implementations of the core persistence traits. Queries are
//! plain runtime-checked `sqlx` queries mapped through row structs, so the
//! crate builds without a live database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propscout_core::conversation::{Role, Session, Source, ToolResponseMarker, Turn};
use propscout_core::map::Position;
use propscout_core::store::{
    ConversationStore, Favorite, FavoritesStore, Lead, LeadDirectory, NewFavorite, StoreError,
    check_appendable,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    owner_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            owner_id: row.owner_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct TurnRow {
    id: Uuid,
    session_id: Uuid,
    role: String,
    content: String,
    sources: Json<Vec<Source>>,
    tool_response: Option<Json<ToolResponseMarker>>,
    interrupted: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<TurnRow> for Turn {
    type Error = StoreError;

    fn try_from(row: TurnRow) -> Result<Self, Self::Error> {
        let role = Role::parse(&row.role).ok_or_else(|| {
            StoreError::Backend(format!("turn {} has unknown role '{}'", row.id, row.role))
        })?;
        Ok(Turn {
            id: row.id,
            session_id: row.session_id,
            role,
            content: row.content,
            sources: row.sources.0,
            tool_response: row.tool_response.map(|marker| marker.0),
            // Only final turns are ever stored.
            is_final: true,
            interrupted: row.interrupted,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct FavoriteRow {
    id: Uuid,
    owner_id: Option<String>,
    session_id: Option<Uuid>,
    property_id: String,
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    note: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<FavoriteRow> for Favorite {
    fn from(row: FavoriteRow) -> Self {
        let position = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(Position::new(latitude, longitude)),
            _ => None,
        };
        Favorite {
            id: row.id,
            owner_id: row.owner_id,
            session_id: row.session_id,
            property_id: row.property_id,
            name: row.name,
            position,
            note: row.note,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct LeadRow {
    id: Uuid,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    status: String,
    interest: Option<String>,
}

impl From<LeadRow> for Lead {
    fn from(row: LeadRow) -> Self {
        Lead {
            id: row.id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            status: row.status,
            interest: row.interest,
        }
    }
}

#[async_trait]
impl ConversationStore for Db {
    async fn create_session(&self, owner_id: Option<String>) -> Result<Session, StoreError> {
        let session = Session::new(owner_id);
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (id, owner_id, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, owner_id, created_at
            "#,
        )
        .bind(session.id)
        .bind(&session.owner_id)
        .bind(session.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.into())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, owner_id, created_at FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(Session::from))
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, owner_id, created_at
            FROM sessions
            WHERE owner_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn append_turn(&self, session_id: Uuid, turn: &Turn) -> Result<(), StoreError> {
        check_appendable(session_id, turn)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO turns (id, session_id, role, content, sources, tool_response, interrupted, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE EXISTS (SELECT 1 FROM sessions WHERE id = $2)
            "#,
        )
        .bind(turn.id)
        .bind(session_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(Json(&turn.sources))
        .bind(turn.tool_response.as_ref().map(Json))
        .bind(turn.interrupted)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session_id));
        }
        Ok(())
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Vec<Turn>, StoreError> {
        if self.get_session(session_id).await?.is_none() {
            return Err(StoreError::SessionNotFound(session_id));
        }
        let rows = sqlx::query_as::<_, TurnRow>(
            r#"
            SELECT id, session_id, role, content, sources, tool_response, interrupted, created_at
            FROM turns
            WHERE session_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(Turn::try_from).collect()
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[async_trait]
impl FavoritesStore for Db {
    async fn save_favorite(&self, favorite: NewFavorite) -> Result<Favorite, StoreError> {
        let row = sqlx::query_as::<_, FavoriteRow>(
            r#"
            INSERT INTO favorites (id, owner_id, session_id, property_id, name, latitude, longitude, note)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, owner_id, session_id, property_id, name, latitude, longitude, note, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&favorite.owner_id)
        .bind(favorite.session_id)
        .bind(&favorite.property_id)
        .bind(&favorite.name)
        .bind(favorite.position.map(|p| p.latitude))
        .bind(favorite.position.map(|p| p.longitude))
        .bind(&favorite.note)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.into())
    }

    async fn list_favorites(&self, owner_id: &str) -> Result<Vec<Favorite>, StoreError> {
        let rows = sqlx::query_as::<_, FavoriteRow>(
            r#"
            SELECT id, owner_id, session_id, property_id, name, latitude, longitude, note, created_at
            FROM favorites
            WHERE owner_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Favorite::from).collect())
    }
}

#[async_trait]
impl LeadDirectory for Db {
    async fn find_leads(&self, query: &str, limit: usize) -> Result<Vec<Lead>, StoreError> {
        let rows = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT id, name, email, phone, status, interest
            FROM leads
            WHERE name ILIKE $1 OR email ILIKE $1 OR phone ILIKE $1 OR interest ILIKE $1
            ORDER BY name ASC
            LIMIT $2
            "#,
        )
        .bind(like_pattern(query))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Lead::from).collect())
    }
}

/// A case-insensitive substring pattern with `LIKE` wildcards escaped.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.trim().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
