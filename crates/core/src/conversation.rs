//! Conversation Model
//!
//! Sessions and the turns they own. A turn starts out partial while the remote
//! model (or the user's transcription) is still streaming and is promoted to
//! final exactly once; only final turns are ever persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::System => "system",
        }
    }

    /// Parses the lowercase storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "model" => Some(Role::Model),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A citation or grounding reference attached to a model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Marks a turn during which the model invoked one or more tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponseMarker {
    pub tools: Vec<String>,
}

/// One utterance in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<ToolResponseMarker>,
    pub is_final: bool,
    /// Set when the turn was cut short by an interruption.
    #[serde(default)]
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Starts a new partial turn with no content.
    pub fn partial(session_id: Uuid, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: String::new(),
            sources: Vec::new(),
            tool_response: None,
            is_final: false,
            interrupted: false,
            created_at: Utc::now(),
        }
    }

    /// Builds a turn that is complete on arrival, e.g. typed user text.
    pub fn complete(session_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        let mut turn = Self::partial(session_id, role);
        turn.content = content.into();
        turn.is_final = true;
        turn
    }

    pub fn push_text(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    /// Records that `tool` was invoked while this turn was in flight.
    pub fn mark_tool(&mut self, tool: &str) {
        let marker = self
            .tool_response
            .get_or_insert_with(|| ToolResponseMarker { tools: Vec::new() });
        if !marker.tools.iter().any(|t| t == tool) {
            marker.tools.push(tool.to_string());
        }
    }

    /// A turn with neither text nor a tool marker carries nothing worth keeping.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_response.is_none() && self.sources.is_empty()
    }
}

/// A conversation owned by a user (or anonymous when `owner_id` is `None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(owner_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_storage_string() {
        for role in [Role::User, Role::Model, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("ai"), None);
        assert_eq!(format!("{}", Role::Model), "model");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        let parsed: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(parsed, Role::System);
    }

    #[test]
    fn test_mark_tool_deduplicates() {
        let mut turn = Turn::partial(Uuid::new_v4(), Role::Model);
        turn.mark_tool("show_area");
        turn.mark_tool("show_area");
        turn.mark_tool("fly_to");
        assert_eq!(
            turn.tool_response.unwrap().tools,
            vec!["show_area".to_string(), "fly_to".to_string()]
        );
    }

    #[test]
    fn test_empty_turn_detection() {
        let session_id = Uuid::new_v4();
        let mut turn = Turn::partial(session_id, Role::Model);
        assert!(turn.is_empty());
        turn.push_text("   ");
        assert!(turn.is_empty());
        turn.mark_tool("clear_map");
        assert!(!turn.is_empty());

        let typed = Turn::complete(session_id, Role::User, "Show Dubai Hills");
        assert!(typed.is_final);
        assert!(!typed.is_empty());
    }

    #[test]
    fn test_turn_serialization_skips_empty_optionals() {
        let turn = Turn::complete(Uuid::new_v4(), Role::User, "hello");
        let json = serde_json::to_value(&turn).unwrap();
        assert!(json.get("sources").is_none());
        assert!(json.get("tool_response").is_none());
        assert_eq!(json["is_final"], true);
        assert_eq!(json["role"], "user");
    }
}
