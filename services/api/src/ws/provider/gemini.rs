//! Gemini Live (`BidiGenerateContent`) over WebSocket.

use super::{Decoder, Encoder, connect_error, next_setup_message, send_json, spawn_link};
use crate::audio_utils;
use async_trait::async_trait;
use propscout_core::conversation::{Role, Source};
use propscout_core::live::{
    Credential, LiveError, LiveEvent, LiveLink, LiveTransport, Outbound, SessionSetup,
};
use propscout_core::tools::ToolCall;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

// --- Local Gemini Live types (for encapsulation) ---
mod gemini_live_types {
    use propscout_core::tools::ToolDeclaration;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum ClientMessage {
        Setup(Setup),
        ClientContent(ClientContent),
        RealtimeInput(RealtimeInput),
        ToolResponse(ToolResponse),
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Setup {
        pub model: String,
        pub generation_config: GenerationConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub system_instruction: Option<Content>,
        pub tools: Vec<Tool>,
        pub input_audio_transcription: Empty,
        pub output_audio_transcription: Empty,
    }

    #[derive(Serialize, Default)]
    pub(super) struct Empty {}

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        pub response_modalities: Vec<ResponseModality>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub(super) enum ResponseModality {
        Audio,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum Tool {
        FunctionDeclarations(Vec<ToolDeclaration>),
        GoogleSearch(Empty),
    }

    #[derive(Serialize)]
    pub(super) struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        pub parts: Vec<Part>,
    }

    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ClientContent {
        pub turns: Vec<Content>,
        pub turn_complete: bool,
    }

    #[derive(Serialize)]
    pub(super) struct RealtimeInput {
        pub audio: Blob,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Blob {
        pub mime_type: String,
        pub data: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ToolResponse {
        pub function_responses: Vec<FunctionResponse>,
    }

    #[derive(Serialize)]
    pub(super) struct FunctionResponse {
        pub id: String,
        pub name: String,
        pub response: Value,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerMessage {
        pub server_content: Option<ServerContent>,
        pub tool_call: Option<ToolCallMessage>,
        pub go_away: Option<GoAway>,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerContent {
        pub model_turn: Option<ModelTurn>,
        pub input_transcription: Option<Transcription>,
        pub output_transcription: Option<Transcription>,
        pub grounding_metadata: Option<GroundingMetadata>,
        #[serde(default)]
        pub interrupted: bool,
        #[serde(default)]
        pub turn_complete: bool,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ModelTurn {
        #[serde(default)]
        pub parts: Vec<ServerPart>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerPart {
        pub text: Option<String>,
        pub inline_data: Option<ServerBlob>,
        #[serde(default)]
        pub thought: bool,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ServerBlob {
        pub data: String,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct Transcription {
        #[serde(default)]
        pub text: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GroundingMetadata {
        #[serde(default)]
        pub grounding_chunks: Vec<GroundingChunk>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct GroundingChunk {
        pub web: Option<WebChunk>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct WebChunk {
        pub uri: String,
        pub title: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ToolCallMessage {
        #[serde(default)]
        pub function_calls: Vec<FunctionCall>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct FunctionCall {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub args: Value,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GoAway {
        pub time_left: Option<String>,
    }
}

use gemini_live_types as wire;

/// Opens Gemini Live sessions.
pub struct GeminiTransport {
    endpoint: String,
    model: String,
}

impl GeminiTransport {
    pub fn new(model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{model}")
        };
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model,
        }
    }

    /// Points the transport at another server, e.g. a local test double.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn setup_message(&self, setup: &SessionSetup) -> wire::ClientMessage {
        let mut tools = Vec::new();
        if !setup.tools.is_empty() {
            tools.push(wire::Tool::FunctionDeclarations(setup.tools.clone()));
        }
        tools.push(wire::Tool::GoogleSearch(wire::Empty {}));

        wire::ClientMessage::Setup(wire::Setup {
            model: self.model.clone(),
            generation_config: wire::GenerationConfig {
                response_modalities: vec![wire::ResponseModality::Audio],
            },
            system_instruction: (!setup.instructions.is_empty()).then(|| wire::Content {
                role: None,
                parts: vec![wire::Part {
                    text: setup.instructions.clone(),
                }],
            }),
            tools,
            input_audio_transcription: wire::Empty {},
            output_audio_transcription: wire::Empty {},
        })
    }
}

/// Earlier turns as context, without asking the model to respond.
fn history_message(setup: &SessionSetup) -> Option<wire::ClientMessage> {
    let turns: Vec<wire::Content> = setup
        .history
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| wire::Content {
            role: Some(
                match turn.role {
                    Role::Model => "model",
                    Role::User | Role::System => "user",
                }
                .to_string(),
            ),
            parts: vec![wire::Part {
                text: turn.content.clone(),
            }],
        })
        .collect();
    if turns.is_empty() {
        return None;
    }
    Some(wire::ClientMessage::ClientContent(wire::ClientContent {
        turns,
        turn_complete: false,
    }))
}

#[async_trait]
impl LiveTransport for GeminiTransport {
    async fn connect(
        &self,
        credential: &Credential,
        setup: &SessionSetup,
    ) -> Result<LiveLink, LiveError> {
        let url = format!("{}?key={}", self.endpoint, credential.expose());
        let (mut stream, _) = connect_async(url).await.map_err(connect_error)?;
        debug!(model = %self.model, "Connected to Gemini Live, sending setup");

        send_json(&mut stream, &self.setup_message(setup)).await?;
        loop {
            let message = next_setup_message(&mut stream).await?;
            if message.get("setupComplete").is_some() {
                break;
            }
            warn!(?message, "Unexpected message before setupComplete");
        }

        if let Some(history) = history_message(setup) {
            send_json(&mut stream, &history).await?;
        }
        info!(
            model = %self.model,
            history = setup.history.len(),
            "Gemini Live session is ready"
        );
        Ok(spawn_link("gemini", stream, GeminiEncoder, GeminiDecoder))
    }
}

pub(crate) struct GeminiEncoder;

impl Encoder for GeminiEncoder {
    fn encode(&mut self, message: Outbound) -> Result<Vec<String>, LiveError> {
        let message = match message {
            Outbound::Audio(pcm) => wire::ClientMessage::RealtimeInput(wire::RealtimeInput {
                audio: wire::Blob {
                    mime_type: format!("audio/pcm;rate={}", audio_utils::LIVE_INPUT_SAMPLE_RATE),
                    data: audio_utils::encode_base64(&pcm),
                },
            }),
            Outbound::Text(text) => wire::ClientMessage::ClientContent(wire::ClientContent {
                turns: vec![wire::Content {
                    role: Some("user".to_string()),
                    parts: vec![wire::Part { text }],
                }],
                turn_complete: true,
            }),
            Outbound::ToolResponse(result) => {
                wire::ClientMessage::ToolResponse(wire::ToolResponse {
                    function_responses: vec![wire::FunctionResponse {
                        response: result.response_payload(),
                        id: result.id,
                        name: result.name,
                    }],
                })
            }
            Outbound::CancelResponse => {
                // Gemini stops generating on its own once new user input arrives.
                debug!("Gemini has no explicit cancel; dropping local playback only");
                return Ok(Vec::new());
            }
        };
        let text = serde_json::to_string(&message).map_err(|e| LiveError::Protocol(e.to_string()))?;
        Ok(vec![text])
    }
}

pub(crate) struct GeminiDecoder;

impl Decoder for GeminiDecoder {
    fn decode(&mut self, text: &str) -> Result<Vec<LiveEvent>, LiveError> {
        let message: wire::ServerMessage =
            serde_json::from_str(text).map_err(|e| LiveError::Protocol(e.to_string()))?;
        let mut events = Vec::new();

        if let Some(content) = message.server_content {
            if let Some(transcription) = content.input_transcription {
                if !transcription.text.is_empty() {
                    events.push(LiveEvent::InputTranscript(transcription.text));
                }
            }
            if let Some(transcription) = content.output_transcription {
                if !transcription.text.is_empty() {
                    events.push(LiveEvent::OutputText(transcription.text));
                }
            }
            for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
                if let Some(blob) = part.inline_data {
                    match audio_utils::decode_base64(&blob.data) {
                        Ok(pcm) => events.push(LiveEvent::Audio(pcm)),
                        Err(e) => warn!(error = %e, "Dropping undecodable audio part"),
                    }
                }
                if let Some(text) = part.text.filter(|t| !part.thought && !t.is_empty()) {
                    events.push(LiveEvent::OutputText(text));
                }
            }
            if let Some(grounding) = content.grounding_metadata {
                let sources: Vec<Source> = grounding
                    .grounding_chunks
                    .into_iter()
                    .filter_map(|chunk| chunk.web)
                    .map(|web| Source {
                        uri: web.uri,
                        title: web.title,
                    })
                    .collect();
                if !sources.is_empty() {
                    events.push(LiveEvent::Sources(sources));
                }
            }
            if content.interrupted {
                events.push(LiveEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(LiveEvent::TurnComplete);
            }
        }

        if let Some(tool_call) = message.tool_call {
            events.extend(tool_call.function_calls.into_iter().map(|call| {
                LiveEvent::ToolCall(ToolCall {
                    id: call.id,
                    name: call.name,
                    args: call.args,
                })
            }));
        }

        if let Some(go_away) = message.go_away {
            events.push(LiveEvent::Dropped {
                reason: format!(
                    "server is closing the session (time left: {})",
                    go_away.time_left.as_deref().unwrap_or("unknown")
                ),
            });
        }

        Ok(events)
    }
}
