//! Axum Handlers for the REST API
//!
//! Session management and conversation replay over HTTP. Every route is
//! scoped to the caller given in the `x-user-id` header; sessions owned by
//! someone else are reported as missing. `utoipa` doc comments generate the
//! OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use propscout_core::conversation::Session;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::{ErrorResponse, FavoriteResponse, SessionResponse, TurnResponse},
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

/// Loads a session and checks that `user_id` owns it.
async fn owned_session(state: &AppState, id: Uuid, user_id: &str) -> Result<Session, ApiError> {
    state
        .store
        .get_session(id)
        .await?
        .filter(|session| session.owner_id.as_deref() == Some(user_id))
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))
}

/// Create a new conversation session.
#[utoipa::path(
    post,
    path = "/sessions",
    responses(
        (status = 201, description = "Session created successfully", body = SessionResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user creating the session")
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let user_id = user_id(&headers)?;
    let session = state.store.create_session(Some(user_id.to_string())).await?;
    info!(session_id = %session.id, "Session created");
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// List all sessions of a user, newest first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of sessions", body = [SessionResponse]),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let user_id = user_id(&headers)?;
    let sessions = state.store.list_sessions(user_id).await?;
    Ok(Json(sessions.into_iter().map(SessionResponse::from).collect()))
}

/// Get a specific session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let session = owned_session(&state, id, user_id).await?;
    Ok(Json(session.into()))
}

/// Delete a session together with its conversation.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, id, user_id).await?;
    if !state.store.delete_session(id).await? {
        return Err(ApiError::NotFound(format!(
            "Session with id '{}' not found",
            id
        )));
    }
    info!(session_id = %id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Replay the final turns of a session in conversation order.
#[utoipa::path(
    get,
    path = "/sessions/{id}/turns",
    responses(
        (status = 200, description = "Turns of the session", body = [TurnResponse]),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn list_turns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TurnResponse>>, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, id, user_id).await?;
    let turns = state.store.load_session(id).await?;
    Ok(Json(turns.into_iter().map(TurnResponse::from).collect()))
}

/// List the properties a user saved as favorites.
#[utoipa::path(
    get,
    path = "/favorites",
    responses(
        (status = 200, description = "Saved favorites, newest first", body = [FavoriteResponse]),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn list_favorites(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<FavoriteResponse>>, ApiError> {
    let user_id = user_id(&headers)?;
    let favorites = state.favorites.list_favorites(user_id).await?;
    Ok(Json(
        favorites.into_iter().map(FavoriteResponse::from).collect(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Config, Provider};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use propscout_core::LiveConfig;
    use propscout_core::conversation::{Role, Turn};
    use propscout_core::live::{Credential, LiveError, LiveLink, LiveTransport, SessionSetup};
    use propscout_core::map::Position;
    use propscout_core::store::{ConversationStore, FavoritesStore, MemoryStore, NewFavorite};
    use std::path::PathBuf;
    use tracing::Level;

    struct UnreachableTransport;

    #[async_trait]
    impl LiveTransport for UnreachableTransport {
        async fn connect(
            &self,
            _credential: &Credential,
            _setup: &SessionSetup,
        ) -> Result<LiveLink, LiveError> {
            Err(LiveError::Transport("offline".to_string()))
        }
    }

    pub(crate) fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            database_url: "postgres://localhost/test".to_string(),
            provider: Provider::Gemini,
            openai_api_key: None,
            gemini_api_key: None,
            live_model: None,
            log_level: Level::INFO,
            prompts_path: PathBuf::from("./prompts"),
            live: LiveConfig::default(),
        }
    }

    pub(crate) fn test_state(store: Arc<MemoryStore>) -> Arc<AppState> {
        Arc::new(AppState {
            store: store.clone(),
            favorites: store.clone(),
            leads: store,
            transport: Arc::new(UnreachableTransport),
            system_prompt: Arc::new("You are a property scout.".to_string()),
            config: Arc::new(test_config()),
        })
    }

    fn headers_for(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_str(user).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let state = test_state(Arc::new(MemoryStore::new()));

        let (status, Json(created)) = create_session(State(state.clone()), headers_for("alice"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.owner_id.as_deref(), Some("alice"));

        let Json(fetched) = get_session(State(state), headers_for("alice"), Path(created.id))
            .await
            .unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_missing_user_header_is_bad_request() {
        let state = test_state(Arc::new(MemoryStore::new()));
        let result = list_sessions(State(state), HeaderMap::new()).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_sessions_of_other_users_are_not_found() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let session = store.create_session(Some("alice".to_string())).await.unwrap();

        let result = get_session(State(state.clone()), headers_for("bob"), Path(session.id)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));

        let result = delete_session(State(state), headers_for("bob"), Path(session.id)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert!(store.get_session(session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_turns_replays_in_order() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let session = store.create_session(Some("alice".to_string())).await.unwrap();
        for (role, text) in [
            (Role::User, "Show me lofts in Soho"),
            (Role::Model, "Here are two."),
            (Role::User, "Save the first one"),
        ] {
            store
                .append_turn(session.id, &Turn::complete(session.id, role, text))
                .await
                .unwrap();
        }

        let Json(turns) = list_turns(State(state), headers_for("alice"), Path(session.id))
            .await
            .unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Show me lofts in Soho", "Here are two.", "Save the first one"]
        );
    }

    #[tokio::test]
    async fn test_delete_session_removes_it() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let session = store.create_session(Some("alice".to_string())).await.unwrap();

        let status = delete_session(State(state.clone()), headers_for("alice"), Path(session.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let Json(sessions) = list_sessions(State(state), headers_for("alice")).await.unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_list_favorites_is_scoped_to_user() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        for owner in ["alice", "bob"] {
            store
                .save_favorite(NewFavorite {
                    owner_id: Some(owner.to_string()),
                    session_id: None,
                    property_id: format!("{owner}-listing"),
                    name: "Townhouse".to_string(),
                    position: Some(Position::new(51.5, -0.12)),
                    note: None,
                })
                .await
                .unwrap();
        }

        let Json(favorites) = list_favorites(State(state), headers_for("alice")).await.unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].property_id, "alice-listing");
    }
}
