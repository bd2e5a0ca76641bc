//! Realtime model providers.
//!
//! Each provider implements `LiveTransport` over a `tokio-tungstenite`
//! connection: it performs the provider-specific session handshake, then
//! hands the socket to a reader/writer task pair that translates between the
//! provider's wire format and `Outbound`/`LiveEvent`.

pub mod gemini;
pub mod openai;

use crate::config::{Config, Provider};
use futures_util::{SinkExt, StreamExt};
use propscout_core::live::{LiveError, LiveEvent, LiveLink, LiveTransport, Outbound};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use tracing::{Instrument, debug, info_span, warn};

/// Builds the transport for the configured provider.
pub fn transport_for(config: &Config) -> Arc<dyn LiveTransport> {
    match config.provider {
        Provider::Gemini => Arc::new(gemini::GeminiTransport::new(config.live_model.clone())),
        Provider::OpenAI => Arc::new(openai::OpenAiTransport::new(config.live_model.clone())),
    }
}

/// Turns session messages into provider frames.
pub(crate) trait Encoder: Send + 'static {
    fn encode(&mut self, message: Outbound) -> Result<Vec<String>, LiveError>;
}

/// Turns provider frames into session events.
pub(crate) trait Decoder: Send + 'static {
    fn decode(&mut self, text: &str) -> Result<Vec<LiveEvent>, LiveError>;
}

const LINK_CHANNEL_CAPACITY: usize = 128;

/// Spawns the reader and writer tasks of an established connection.
pub(crate) fn spawn_link<S>(
    provider: &'static str,
    stream: WebSocketStream<S>,
    mut encoder: impl Encoder,
    mut decoder: impl Decoder,
) -> LiveLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(LINK_CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<LiveEvent>(LINK_CHANNEL_CAPACITY);

    let writer_events = inbound_tx.clone();
    tokio::spawn(
        async move {
            while let Some(message) = outbound_rx.recv().await {
                let frames = match encoder.encode(message) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                for frame in frames {
                    if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                        let _ = writer_events
                            .send(LiveEvent::Dropped {
                                reason: format!("send failed: {e}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            debug!("Outbound channel closed, closing the connection");
            let _ = sink.close().await;
        }
        .instrument(info_span!("live_writer", provider)),
    );

    tokio::spawn(
        async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(WsMessage::Text(text)) => text.to_string(),
                    // Gemini delivers its JSON messages as binary frames.
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            let error = LiveError::Protocol("non UTF-8 binary frame".to_string());
                            warn!(error = %error, "Malformed stream, failing the link");
                            let _ = inbound_tx.send(LiveEvent::Failed(error)).await;
                            return;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        let _ = inbound_tx.send(close_event(frame)).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx
                            .send(LiveEvent::Dropped {
                                reason: format!("receive failed: {e}"),
                            })
                            .await;
                        return;
                    }
                };

                let events = match decoder.decode(&text) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "Malformed stream, failing the link");
                        let _ = inbound_tx.send(LiveEvent::Failed(e)).await;
                        return;
                    }
                };
                for event in events {
                    if inbound_tx.send(event).await.is_err() {
                        debug!("Session released the link");
                        return;
                    }
                }
            }
            let _ = inbound_tx
                .send(LiveEvent::Dropped {
                    reason: "connection closed without a close frame".to_string(),
                })
                .await;
        }
        .instrument(info_span!("live_reader", provider)),
    );

    LiveLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

/// Classifies a close frame received on an established connection.
pub(crate) fn close_event(frame: Option<CloseFrame>) -> LiveEvent {
    let Some(frame) = frame else {
        return LiveEvent::Dropped {
            reason: "connection closed without a close frame".to_string(),
        };
    };
    let reason = frame.reason.as_str().to_string();
    match frame.code {
        CloseCode::Normal => LiveEvent::Ended,
        CloseCode::Invalid | CloseCode::Policy => LiveEvent::Failed(LiveError::Rejected(reason)),
        code => LiveEvent::Dropped {
            reason: format!("closed with code {}: {reason}", u16::from(code)),
        },
    }
}

/// Maps a failure to open the socket.
pub(crate) fn connect_error(err: tungstenite::Error) -> LiveError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 400 | 401 | 403) =>
        {
            LiveError::Rejected(format!("handshake refused with HTTP {}", response.status()))
        }
        other => LiveError::Transport(other.to_string()),
    }
}

/// Maps a close frame received before the session was confirmed.
pub(crate) fn handshake_close_error(frame: Option<CloseFrame>) -> LiveError {
    match close_event(frame) {
        LiveEvent::Failed(error) => error,
        LiveEvent::Dropped { reason } => LiveError::Transport(reason),
        _ => LiveError::Transport("connection closed during session setup".to_string()),
    }
}

/// Reads the next JSON message during a handshake.
pub(crate) async fn next_setup_message<S>(
    stream: &mut WebSocketStream<S>,
) -> Result<serde_json::Value, LiveError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let text = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => text.to_string(),
            Some(Ok(WsMessage::Binary(data))) => String::from_utf8(data.to_vec())
                .map_err(|_| LiveError::Protocol("non UTF-8 frame during setup".to_string()))?,
            Some(Ok(WsMessage::Close(frame))) => return Err(handshake_close_error(frame)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(LiveError::Transport(e.to_string())),
            None => {
                return Err(LiveError::Transport(
                    "connection closed during session setup".to_string(),
                ));
            }
        };
        return serde_json::from_str(&text)
            .map_err(|e| LiveError::Protocol(format!("invalid setup message: {e}")));
    }
}

pub(crate) async fn send_json<S, T>(
    stream: &mut WebSocketStream<S>,
    message: &T,
) -> Result<(), LiveError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let text = serde_json::to_string(message).map_err(|e| LiveError::Protocol(e.to_string()))?;
    stream
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| LiveError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    struct Silent;

    impl Encoder for Silent {
        fn encode(&mut self, _message: Outbound) -> Result<Vec<String>, LiveError> {
            Ok(Vec::new())
        }
    }

    /// Accepts `{"text": ..}` frames only.
    struct TextOnly;

    impl Decoder for TextOnly {
        fn decode(&mut self, text: &str) -> Result<Vec<LiveEvent>, LiveError> {
            let value: serde_json::Value =
                serde_json::from_str(text).map_err(|e| LiveError::Protocol(e.to_string()))?;
            match value["text"].as_str() {
                Some(text) => Ok(vec![LiveEvent::OutputText(text.to_string())]),
                None => Err(LiveError::Protocol("missing text".to_string())),
            }
        }
    }

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(4096);
        (
            WebSocketStream::from_raw_socket(client, Role::Client, None).await,
            WebSocketStream::from_raw_socket(server, Role::Server, None).await,
        )
    }

    async fn assert_fails_after_first_text(garbage: WsMessage) {
        let (client, mut server) = socket_pair().await;
        let mut link = spawn_link("test", client, Silent, TextOnly);

        for message in [
            WsMessage::Text(r#"{"text":"Hello"}"#.to_string().into()),
            garbage,
            WsMessage::Text(r#"{"text":"never seen"}"#.to_string().into()),
        ] {
            server.send(message).await.unwrap();
        }

        assert_eq!(
            link.inbound.recv().await,
            Some(LiveEvent::OutputText("Hello".to_string()))
        );
        assert!(matches!(
            link.inbound.recv().await,
            Some(LiveEvent::Failed(LiveError::Protocol(_)))
        ));

        // The reader stopped; once the writer goes too the link is empty.
        drop(link.outbound);
        assert_eq!(link.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_undecodable_message_fails_the_link() {
        assert_fails_after_first_text(WsMessage::Text("{not json".to_string().into())).await;
    }

    #[tokio::test]
    async fn test_non_utf8_binary_frame_fails_the_link() {
        assert_fails_after_first_text(WsMessage::Binary(vec![0xff, 0xfe, 0x00].into())).await;
    }

    fn frame(code: CloseCode, reason: &str) -> Option<CloseFrame> {
        Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })
    }

    #[test]
    fn test_close_event_classification() {
        assert_eq!(close_event(frame(CloseCode::Normal, "")), LiveEvent::Ended);
        assert_eq!(
            close_event(frame(CloseCode::Policy, "API key not valid")),
            LiveEvent::Failed(LiveError::Rejected("API key not valid".to_string()))
        );
        assert!(matches!(
            close_event(frame(CloseCode::Away, "restart")),
            LiveEvent::Dropped { .. }
        ));
        assert!(matches!(close_event(None), LiveEvent::Dropped { .. }));
    }

    #[test]
    fn test_handshake_close_is_an_error() {
        assert_eq!(
            handshake_close_error(frame(CloseCode::Invalid, "bad model")),
            LiveError::Rejected("bad model".to_string())
        );
        assert!(matches!(
            handshake_close_error(frame(CloseCode::Normal, "")),
            LiveError::Transport(_)
        ));
        assert!(matches!(
            handshake_close_error(frame(CloseCode::Error, "overloaded")),
            LiveError::Transport(_)
        ));
    }
}
