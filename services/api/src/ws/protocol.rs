//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Control messages are JSON objects tagged by `type`. Microphone audio is sent
//! by the client as binary frames of PCM16 mono at 24 kHz; model audio is sent
//! back as base64 inside `audio_chunk` messages.

use crate::audio_utils;
use propscout_core::conversation::Turn;
use propscout_core::geometry::LayoutSnapshot;
use propscout_core::live::{ConnectionState, SessionInput, SessionOutput};
use propscout_core::map::ViewportCommand;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Creates or resumes a session. This must be the first message.
    Init {
        /// The session to resume; a new one is created when absent.
        #[serde(default)]
        session_id: Option<Uuid>,
        /// The signed-in user, if any.
        #[serde(default)]
        user_id: Option<String>,
    },
    /// Connects to the live model.
    Start,
    /// Ends the live conversation.
    Stop,
    /// Stops the model mid-answer.
    Interrupt,
    /// A typed message from the user.
    UserMessage { text: String },
    /// The current layout of the map overlays.
    Layout(LayoutSnapshot),
    /// The 3D map finished loading and accepts commands.
    ViewportReady,
    ViewportLost,
    /// The user moved the camera by hand.
    CameraChanged,
    /// A camera transition issued by the server completed.
    TransitionFinished { transition_id: u64 },
}

impl ClientMessage {
    /// The session input this message maps to. `Init` has none.
    pub fn into_input(self) -> Option<SessionInput> {
        let input = match self {
            ClientMessage::Init { .. } => return None,
            ClientMessage::Start => SessionInput::Start,
            ClientMessage::Stop => SessionInput::Stop,
            ClientMessage::Interrupt => SessionInput::Interrupt,
            ClientMessage::UserMessage { text } => SessionInput::UserText(text),
            ClientMessage::Layout(layout) => SessionInput::Layout(layout),
            ClientMessage::ViewportReady => SessionInput::ViewportReady,
            ClientMessage::ViewportLost => SessionInput::ViewportLost,
            ClientMessage::CameraChanged => SessionInput::CameraMoved,
            ClientMessage::TransitionFinished { transition_id } => {
                SessionInput::TransitionFinished(transition_id)
            }
        };
        Some(input)
    }
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session and replays its earlier turns for display.
    Initialized { session_id: Uuid, history: Vec<Turn> },
    ConnectionState { state: ConnectionState },
    /// A partial or final turn; partial turns are re-sent as they grow.
    Turn { turn: Turn },
    /// A chunk of model audio (base64 encoded PCM16, 24 kHz).
    AudioChunk { data: String },
    /// Discard any model audio queued for playback.
    StopPlayback,
    Viewport(ViewportCommand),
    Error { message: String, retryable: bool },
    Warning { message: String },
}

impl From<SessionOutput> for ServerMessage {
    fn from(output: SessionOutput) -> Self {
        match output {
            SessionOutput::State(state) => ServerMessage::ConnectionState { state },
            SessionOutput::Turn(turn) => ServerMessage::Turn { turn },
            SessionOutput::Audio(chunk) => ServerMessage::AudioChunk {
                data: audio_utils::encode_base64(&chunk),
            },
            SessionOutput::StopPlayback => ServerMessage::StopPlayback,
            SessionOutput::Viewport(command) => ServerMessage::Viewport(command),
            SessionOutput::Error { message, retryable } => {
                ServerMessage::Error { message, retryable }
            }
            SessionOutput::Warning(message) => ServerMessage::Warning { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn test_parse_init() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"init"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Init {
                session_id: None,
                user_id: None
            }
        );
        assert_eq!(msg.into_input(), None);
    }

    #[test]
    fn test_parse_layout() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "layout",
            "viewport_width": 1280.0,
            "viewport_height": 800.0,
            "transcript_panel": { "width": 400.0, "height": 800.0 }
        }))
        .unwrap();

        let Some(SessionInput::Layout(layout)) = msg.into_input() else {
            panic!("expected a layout input");
        };
        assert_eq!(layout.viewport_width, 1280.0);
        assert!(layout.control_tray.is_none());
    }

    #[test]
    fn test_control_messages_map_to_inputs() {
        let cases = [
            (json!({"type": "start"}), SessionInput::Start),
            (json!({"type": "interrupt"}), SessionInput::Interrupt),
            (json!({"type": "camera_changed"}), SessionInput::CameraMoved),
            (
                json!({"type": "transition_finished", "transition_id": 7}),
                SessionInput::TransitionFinished(7),
            ),
            (
                json!({"type": "user_message", "text": "hi"}),
                SessionInput::UserText("hi".to_string()),
            ),
        ];
        for (raw, expected) in cases {
            let msg: ClientMessage = serde_json::from_value(raw).unwrap();
            assert_eq!(msg.into_input(), Some(expected));
        }
    }

    #[test]
    fn test_unknown_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_viewport_command_is_inlined() {
        let msg = ServerMessage::from(SessionOutput::Viewport(ViewportCommand::ClearMarkers));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "viewport", "command": "clear_markers"}));
    }

    #[test]
    fn test_audio_is_base64_encoded() {
        let msg = ServerMessage::from(SessionOutput::Audio(Bytes::from_static(&[1, 2, 3])));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "audio_chunk", "data": "AQID"}));
    }

    #[test]
    fn test_connection_state_serialization() {
        let msg = ServerMessage::from(SessionOutput::State(ConnectionState::Suspended));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "connection_state", "state": "suspended"}));
    }
}
