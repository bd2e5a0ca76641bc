//! OpenAI Realtime over WebSocket.

use super::{Decoder, Encoder, connect_error, next_setup_message, send_json, spawn_link};
use crate::audio_utils::{self, StreamResampler};
use async_trait::async_trait;
use propscout_core::conversation::Role;
use propscout_core::live::{
    Credential, LiveError, LiveEvent, LiveLink, LiveTransport, Outbound, SessionSetup,
};
use propscout_core::tools::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite::client::IntoClientRequest};
use tracing::{debug, info, warn};

const DEFAULT_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Server events the session cares about; everything else is ignored.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },
    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct ErrorDetail {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Maps an in-band error to a link event. Most errors concern a single
/// request and leave the session usable; these do not.
fn error_event(error: ErrorDetail) -> Option<LiveEvent> {
    match (error.kind.as_deref(), error.code.as_deref()) {
        (_, Some("session_expired")) => Some(LiveEvent::Dropped {
            reason: error.message,
        }),
        (Some("authentication_error" | "permission_error"), _)
        | (_, Some("invalid_api_key" | "insufficient_quota" | "model_not_found")) => {
            Some(LiveEvent::Failed(LiveError::Rejected(error.message)))
        }
        (_, Some("invalid_session" | "session_not_found")) => {
            Some(LiveEvent::Failed(LiveError::Protocol(error.message)))
        }
        (kind, code) => {
            warn!(?kind, ?code, message = %error.message, "OpenAI Realtime reported an error");
            None
        }
    }
}

#[derive(Serialize)]
struct FunctionTool<'a> {
    r#type: &'static str,
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

/// Opens OpenAI Realtime sessions.
pub struct OpenAiTransport {
    endpoint: String,
    model: String,
}

impl OpenAiTransport {
    pub fn new(model: Option<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    /// Points the transport at another server, e.g. a local test double.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

fn session_update(setup: &SessionSetup) -> Value {
    let tools: Vec<FunctionTool<'_>> = setup
        .tools
        .iter()
        .map(|tool| FunctionTool {
            r#type: "function",
            name: &tool.name,
            description: &tool.description,
            parameters: &tool.parameters,
        })
        .collect();
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": setup.instructions,
            "voice": "alloy",
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": "whisper-1" },
            "turn_detection": {
                "type": "server_vad",
                "threshold": 0.5,
                "prefix_padding_ms": 200,
                "silence_duration_ms": 700
            },
            "tools": tools,
            "tool_choice": "auto"
        }
    })
}

fn history_items(setup: &SessionSetup) -> Vec<Value> {
    setup
        .history
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| {
            let (role, content_type) = match turn.role {
                Role::Model => ("assistant", "text"),
                Role::User => ("user", "input_text"),
                Role::System => ("system", "input_text"),
            };
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": role,
                    "content": [{ "type": content_type, "text": turn.content }]
                }
            })
        })
        .collect()
}

#[async_trait]
impl LiveTransport for OpenAiTransport {
    async fn connect(
        &self,
        credential: &Credential,
        setup: &SessionSetup,
    ) -> Result<LiveLink, LiveError> {
        let url = format!("{}?model={}", self.endpoint, self.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| LiveError::Transport(e.to_string()))?;
        let authorization = format!("Bearer {}", credential.expose())
            .parse()
            .map_err(|_| LiveError::Rejected("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", authorization);
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse().map_err(|_| {
                LiveError::Protocol("invalid OpenAI-Beta header".to_string())
            })?);

        let (mut stream, _) = connect_async(request).await.map_err(connect_error)?;
        debug!(model = %self.model, "Connected to OpenAI Realtime, updating session");

        send_json(&mut stream, &session_update(setup)).await?;
        loop {
            let message = next_setup_message(&mut stream).await?;
            match serde_json::from_value::<ServerEvent>(message) {
                Ok(ServerEvent::SessionUpdated) => break,
                Ok(ServerEvent::Error { error }) => {
                    return Err(LiveError::Rejected(error.message));
                }
                Ok(_) => continue,
                Err(e) => warn!(error = %e, "Unexpected message before session.updated"),
            }
        }

        for item in history_items(setup) {
            send_json(&mut stream, &item).await?;
        }
        info!(
            model = %self.model,
            history = setup.history.len(),
            "OpenAI Realtime session is ready"
        );
        Ok(spawn_link(
            "openai",
            stream,
            OpenAiEncoder::new()?,
            OpenAiDecoder,
        ))
    }
}

pub(crate) struct OpenAiEncoder {
    resampler: StreamResampler,
}

impl OpenAiEncoder {
    fn new() -> Result<Self, LiveError> {
        let resampler = StreamResampler::new(
            audio_utils::LIVE_INPUT_SAMPLE_RATE,
            audio_utils::OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
        )
        .map_err(|e| LiveError::Protocol(format!("cannot build resampler: {e}")))?;
        Ok(Self { resampler })
    }
}

impl Encoder for OpenAiEncoder {
    fn encode(&mut self, message: Outbound) -> Result<Vec<String>, LiveError> {
        let frames = match message {
            Outbound::Audio(pcm) => {
                let resampled = self.resampler.process(&audio_utils::pcm16_from_bytes(&pcm));
                if resampled.is_empty() {
                    return Ok(Vec::new());
                }
                let audio = audio_utils::bytes_from_pcm16(&resampled);
                vec![json!({
                    "type": "input_audio_buffer.append",
                    "audio": audio_utils::encode_base64(&audio),
                })]
            }
            Outbound::Text(text) => vec![
                json!({
                    "type": "conversation.item.create",
                    "item": {
                        "type": "message",
                        "role": "user",
                        "content": [{ "type": "input_text", "text": text }]
                    }
                }),
                json!({ "type": "response.create" }),
            ],
            Outbound::ToolResponse(result) => vec![
                json!({
                    "type": "conversation.item.create",
                    "item": {
                        "type": "function_call_output",
                        "call_id": result.id,
                        "output": result.response_payload().to_string(),
                    }
                }),
                json!({ "type": "response.create" }),
            ],
            Outbound::CancelResponse => vec![json!({ "type": "response.cancel" })],
        };
        Ok(frames.iter().map(Value::to_string).collect())
    }
}

pub(crate) struct OpenAiDecoder;

impl Decoder for OpenAiDecoder {
    fn decode(&mut self, text: &str) -> Result<Vec<LiveEvent>, LiveError> {
        let event: ServerEvent =
            serde_json::from_str(text).map_err(|e| LiveError::Protocol(e.to_string()))?;
        let events = match event {
            ServerEvent::InputTranscriptionCompleted { transcript } if !transcript.is_empty() => {
                vec![LiveEvent::InputTranscript(transcript)]
            }
            ServerEvent::AudioDelta { delta } => match audio_utils::decode_base64(&delta) {
                Ok(pcm) => vec![LiveEvent::Audio(pcm)],
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable audio delta");
                    Vec::new()
                }
            },
            ServerEvent::AudioTranscriptDelta { delta } | ServerEvent::TextDelta { delta } => {
                vec![LiveEvent::OutputText(delta)]
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                // Malformed arguments reach the dispatcher as a string and are
                // answered with an in-band error.
                let args = serde_json::from_str(&arguments).unwrap_or(Value::String(arguments));
                vec![LiveEvent::ToolCall(ToolCall {
                    id: call_id,
                    name,
                    args,
                })]
            }
            ServerEvent::SpeechStarted => vec![LiveEvent::Interrupted],
            ServerEvent::ResponseDone => vec![LiveEvent::TurnComplete],
            ServerEvent::Error { error } => error_event(error).into_iter().collect(),
            _ => Vec::new(),
        };
        Ok(events)
    }
}
