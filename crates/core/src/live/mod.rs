//! Live Session
//!
//! The bidirectional link to the remote conversational model and the state
//! machine that drives it. `Orchestrator` is IO-free: it consumes events and
//! returns `Command`s. `LiveSession` is the async runtime that owns one
//! orchestrator, one map choreographer and one tool dispatcher, and executes
//! those commands.

mod audio;
mod orchestrator;
mod runtime;
mod state;

pub use audio::AudioBuffer;
pub use orchestrator::Orchestrator;
pub use runtime::{LiveSession, SessionInput, SessionOutput};
pub use state::{ConnectionState, TransitionError, validate_transition};

use crate::conversation::{Source, Turn};
use crate::tools::{ToolCall, ToolDeclaration, ToolResult};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// The API key used to open a live link.
#[derive(Clone)]
pub struct Credential(Arc<SecretString>);

impl Credential {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(api_key.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Everything the remote needs to configure a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSetup {
    pub instructions: String,
    pub tools: Vec<ToolDeclaration>,
    /// Earlier turns of a resumed conversation, oldest first.
    pub history: Vec<Turn>,
}

/// Everything the remote can tell us, already demultiplexed by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// A delta of the transcription of the user's speech.
    InputTranscript(String),
    /// A delta of model text or of the transcription of model speech.
    OutputText(String),
    /// PCM16 model audio.
    Audio(Bytes),
    /// Grounding references for the current model turn.
    Sources(Vec<Source>),
    ToolCall(ToolCall),
    TurnComplete,
    /// The remote detected barge-in and stopped generating.
    Interrupted,
    /// The link dropped in a way that may recover.
    Dropped { reason: String },
    /// The remote ended the session normally.
    Ended,
    /// The remote reported an unrecoverable failure.
    Failed(LiveError),
}

/// Messages sent to the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// PCM16 microphone audio, 16 kHz mono.
    Audio(Bytes),
    Text(String),
    ToolResponse(ToolResult),
    /// Ask the remote to abandon the response it is generating.
    CancelResponse,
}

/// An open connection. Dropping `outbound` closes the link.
#[derive(Debug)]
pub struct LiveLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<LiveEvent>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiveError {
    #[error("no API key is configured for the live model")]
    MissingCredential,
    #[error("the live model rejected the session: {0}")]
    Rejected(String),
    #[error("session setup was not confirmed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl LiveError {
    /// Whether retrying the connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LiveError::Transport(_) | LiveError::HandshakeTimeout(_))
    }
}

/// Opens live links to a remote model.
///
/// `connect` resolves only after the remote confirmed the session setup.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn connect(
        &self,
        credential: &Credential,
        setup: &SessionSetup,
    ) -> Result<LiveLink, LiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("sk-very-secret");
        assert_eq!(format!("{credential:?}"), "Credential([REDACTED])");
        assert_eq!(credential.expose(), "sk-very-secret");
    }

    #[test]
    fn test_transient_errors() {
        assert!(LiveError::Transport("reset".into()).is_transient());
        assert!(LiveError::HandshakeTimeout(Duration::from_secs(1)).is_transient());
        assert!(!LiveError::Rejected("bad key".into()).is_transient());
        assert!(!LiveError::MissingCredential.is_transient());
    }
}
