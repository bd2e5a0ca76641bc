//! Manages the browser WebSocket connection of a live session.
//!
//! The first client message must be `init`, which creates or resumes a
//! conversation. Afterwards the connection is bridged to a `LiveSession`:
//! control messages and microphone audio go in, turns, audio, connection
//! state and viewport commands come out. A stopped live session is replaced
//! by a fresh one on the next `start`, with the conversation reloaded from
//! the store.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{audio_utils, audio_utils::StreamResampler, state::AppState};
use anyhow::{Context, Result, anyhow, bail};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use propscout_core::conversation::{Session, Turn};
use propscout_core::geometry::LayoutSnapshot;
use propscout_core::live::{LiveSession, SessionInput, SessionOutput};
use propscout_core::map::{Marker, ViewState};
use propscout_core::tools::{FavoritesToolHandler, LeadLookupHandler, ToolRegistry};
use std::fmt::Display;
use std::future::pending;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{Instrument, debug, error, info, instrument, warn};

const CHANNEL_CAPACITY: usize = 64;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (socket_tx, socket_rx) = socket.split();
    serve_client(socket_tx, socket_rx, state).await;
}

/// Runs one client connection from `init` to disconnect.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
pub(crate) async fn serve_client<Tx, Rx, E>(mut socket_tx: Tx, mut socket_rx: Rx, state: Arc<AppState>)
where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: std::error::Error + Send + Sync + 'static,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    info!("New WebSocket connection. Awaiting initialization...");

    // The first message from the client must be an `init` message.
    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => initialize_session(text.as_str(), &state).await,
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (session, history) = match init {
        Ok(initialized) => initialized,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                    retryable: false,
                },
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("session_id", tracing::field::display(session.id));
    info!(turns = history.len(), "Session initialized");

    if send_msg(
        &mut socket_tx,
        ServerMessage::Initialized {
            session_id: session.id,
            history: history.clone(),
        },
    )
    .await
    .is_err()
    {
        error!("Failed to send Initialized message to client.");
        return;
    }

    let resampler = match StreamResampler::new(
        audio_utils::FRONTEND_MIC_SAMPLE_RATE,
        audio_utils::LIVE_INPUT_SAMPLE_RATE,
    ) {
        Ok(resampler) => resampler,
        Err(e) => {
            error!(error = ?e, "Failed to create the microphone resampler");
            return;
        }
    };

    let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let pump = tokio::spawn(forward_output(socket_tx, output_rx).in_current_span());

    let mut bridge = Bridge {
        state,
        session,
        output: output_tx,
        live: None,
        layout: None,
        viewport_ready: false,
        markers: Vec::new(),
        resampler,
    };
    bridge.live = Some(bridge.spawn_live(history));
    bridge.run(socket_rx).await;

    drop(bridge);
    let _ = pump.await;
    info!("WebSocket session finished.");
}

/// Parses the `init` message and loads or creates the session it names.
async fn initialize_session(init_text: &str, state: &AppState) -> Result<(Session, Vec<Turn>)> {
    let init_msg: ClientMessage =
        serde_json::from_str(init_text).context("Invalid `init` message")?;
    let ClientMessage::Init {
        session_id,
        user_id,
    } = init_msg
    else {
        bail!("First message must be `init`");
    };

    match session_id {
        Some(id) => {
            // Anonymous sessions can be resumed by anyone holding the id.
            let session = state
                .store
                .get_session(id)
                .await?
                .filter(|s| s.owner_id.is_none() || s.owner_id == user_id)
                .with_context(|| format!("Session '{id}' not found"))?;
            let history = state.store.load_session(id).await?;
            info!(session_id = %id, "Resuming existing session");
            Ok((session, history))
        }
        None => {
            let session = state.store.create_session(user_id).await?;
            info!(session_id = %session.id, "Created new session");
            Ok((session, Vec::new()))
        }
    }
}

/// Serializes session output onto the client socket until every sender is gone.
async fn forward_output<Tx>(mut socket_tx: Tx, mut output_rx: mpsc::Receiver<SessionOutput>)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: std::error::Error + Send + Sync + 'static,
{
    while let Some(output) = output_rx.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, output.into()).await {
            warn!(error = %e, "Failed to send to client, dropping further output");
            return;
        }
    }
    let _ = socket_tx.close().await;
}

struct LiveHandle {
    input: mpsc::Sender<SessionInput>,
    task: JoinHandle<ViewState>,
}

/// Client-side state that outlives a single live session.
struct Bridge {
    state: Arc<AppState>,
    session: Session,
    output: mpsc::Sender<SessionOutput>,
    live: Option<LiveHandle>,
    layout: Option<LayoutSnapshot>,
    viewport_ready: bool,
    /// Markers the client shows, as left by the last live session.
    markers: Vec<Marker>,
    resampler: StreamResampler,
}

impl Bridge {
    fn spawn_live(&self, history: Vec<Turn>) -> LiveHandle {
        let state = &self.state;
        let tools = ToolRegistry::new()
            .register(Arc::new(FavoritesToolHandler::new(
                state.favorites.clone(),
                self.session.owner_id.clone(),
                Some(self.session.id),
            )))
            .register(Arc::new(LeadLookupHandler::new(state.leads.clone())));

        let live = LiveSession::new(
            self.session.id,
            state.config.live.clone(),
            state.transport.clone(),
            state.config.credential(),
            state.store.clone(),
        )
        .with_instructions(state.system_prompt.as_str())
        .with_tools(tools)
        .with_history(history)
        .with_markers(self.markers.clone());

        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        // The client keeps its map across live sessions; replay what the new
        // runtime needs to drive it.
        if let Some(layout) = self.layout {
            let _ = input_tx.try_send(SessionInput::Layout(layout));
        }
        if self.viewport_ready {
            let _ = input_tx.try_send(SessionInput::ViewportReady);
        }

        let output = self.output.clone();
        let task = tokio::spawn(live.run(input_rx, output).in_current_span());
        LiveHandle {
            input: input_tx,
            task,
        }
    }

    async fn run<Rx, E>(&mut self, mut socket_rx: Rx)
    where
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            tokio::select! {
                incoming = socket_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => self.on_client_message(msg).await,
                            Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => self.on_audio(&data).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the connection.");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {}", e);
                        break;
                    }
                },
                view = join_live(&mut self.live) => {
                    if let Some(view) = view {
                        self.markers = view.markers;
                    }
                    debug!("Live session ended; a new one starts on the next `start`.");
                }
            }
        }
        self.shutdown_live().await;
    }

    async fn on_client_message(&mut self, msg: ClientMessage) {
        match &msg {
            ClientMessage::Init { .. } => {
                warn!("Ignoring repeated `init` message.");
                return;
            }
            ClientMessage::Layout(layout) => self.layout = Some(*layout),
            ClientMessage::ViewportReady => self.viewport_ready = true,
            ClientMessage::ViewportLost => self.viewport_ready = false,
            ClientMessage::Start if self.live.is_none() => {
                match self.state.store.load_session(self.session.id).await {
                    Ok(history) => self.live = Some(self.spawn_live(history)),
                    Err(e) => {
                        error!(error = %e, "Failed to reload the conversation");
                        self.reply_error("The conversation could not be loaded.", true)
                            .await;
                        return;
                    }
                }
            }
            _ => {}
        }

        let is_user_message = matches!(msg, ClientMessage::UserMessage { .. });
        let Some(input) = msg.into_input() else {
            return;
        };
        match &self.live {
            Some(live) => {
                if live.input.send(input).await.is_err() {
                    debug!("Live session is shutting down, input dropped");
                }
            }
            None if is_user_message => {
                self.reply_error("The live session is not running. Press start to reconnect.", true)
                    .await;
            }
            None => debug!("No live session, input dropped"),
        }
    }

    async fn on_audio(&mut self, data: &[u8]) {
        let pcm = self.resampler.process(&audio_utils::pcm16_from_bytes(data));
        if pcm.is_empty() {
            return;
        }
        if let Some(live) = &self.live {
            // Audio is only useful in real time; drop it rather than queue behind a stalled session.
            if live
                .input
                .try_send(SessionInput::Audio(audio_utils::bytes_from_pcm16(&pcm)))
                .is_err()
            {
                debug!("Live session input is full, dropping microphone audio");
            }
        }
    }

    async fn reply_error(&self, message: &str, retryable: bool) {
        let _ = self
            .output
            .send(SessionOutput::Error {
                message: message.to_string(),
                retryable,
            })
            .await;
    }

    /// Stops the live session and waits until its turns are persisted.
    async fn shutdown_live(&mut self) {
        if let Some(LiveHandle { input, task }) = self.live.take() {
            drop(input);
            match task.await {
                Ok(view) => self.markers = view.markers,
                Err(e) => error!(error = %e, "Live session task failed"),
            }
        }
    }
}

/// Waits for the running live session to end and returns its final view.
async fn join_live(live: &mut Option<LiveHandle>) -> Option<ViewState> {
    let Some(handle) = live else {
        return pending().await;
    };
    let joined = (&mut handle.task).await;
    *live = None;
    joined
        .inspect_err(|e| error!(error = %e, "Live session task failed"))
        .ok()
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg<Tx>(socket_tx: &mut Tx, msg: ServerMessage) -> Result<()>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: std::error::Error + Send + Sync + 'static,
{
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{test_config, test_state};
    use async_trait::async_trait;
    use futures_util::{sink, stream};
    use propscout_core::conversation::Role;
    use propscout_core::live::{
        Credential, LiveError, LiveEvent, LiveLink, LiveTransport, Outbound, SessionSetup,
    };
    use propscout_core::store::{ConversationStore, MemoryStore};
    use propscout_core::tools::ToolCall;
    use serde_json::{Value, json};
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// The model side of an accepted connection.
    struct Remote {
        setup: SessionSetup,
        outbound: mpsc::Receiver<Outbound>,
        inbound: mpsc::Sender<LiveEvent>,
    }

    #[derive(Default)]
    struct AcceptingTransport {
        remotes: Mutex<Vec<Remote>>,
    }

    #[async_trait]
    impl LiveTransport for AcceptingTransport {
        async fn connect(
            &self,
            _credential: &Credential,
            setup: &SessionSetup,
        ) -> Result<LiveLink, LiveError> {
            let (outbound_tx, outbound_rx) = mpsc::channel(16);
            let (inbound_tx, inbound_rx) = mpsc::channel(16);
            self.remotes.lock().unwrap().push(Remote {
                setup: setup.clone(),
                outbound: outbound_rx,
                inbound: inbound_tx,
            });
            Ok(LiveLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
    }

    struct Client {
        to_server: mpsc::Sender<Message>,
        from_server: mpsc::Receiver<Message>,
        served: JoinHandle<()>,
    }

    impl Client {
        fn connect(state: Arc<AppState>) -> Self {
            let (to_server, server_rx) = mpsc::channel::<Message>(64);
            let (server_tx, from_server) = mpsc::channel::<Message>(64);

            let socket_rx = Box::pin(stream::unfold(server_rx, |mut rx| async move {
                rx.recv().await.map(|msg| (Ok::<_, Infallible>(msg), rx))
            }));
            let socket_tx = Box::pin(sink::unfold(server_tx, |tx, msg: Message| async move {
                let _ = tx.send(msg).await;
                Ok::<_, Infallible>(tx)
            }));

            let served = tokio::spawn(serve_client(socket_tx, socket_rx, state));
            Self {
                to_server,
                from_server,
                served,
            }
        }

        async fn send(&self, value: Value) {
            self.to_server
                .send(Message::Text(value.to_string().into()))
                .await
                .unwrap();
        }

        async fn next(&mut self) -> Value {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.from_server.recv())
                .await
                .expect("timed out waiting for a server message")
                .expect("server closed the socket");
            serde_json::from_str(msg.to_text().unwrap()).unwrap()
        }

        async fn next_of_type(&mut self, kind: &str) -> Value {
            loop {
                let msg = self.next().await;
                if msg["type"] == kind {
                    return msg;
                }
            }
        }

        async fn close(self) {
            drop(self.to_server);
            tokio::time::timeout(Duration::from_secs(5), self.served)
                .await
                .expect("session did not shut down")
                .unwrap();
        }
    }

    fn state_with(store: Arc<MemoryStore>, transport: Arc<AcceptingTransport>) -> Arc<AppState> {
        let mut config = test_config();
        config.gemini_api_key = Some("test-key".to_string());
        let state = test_state(store);
        Arc::new(AppState {
            transport,
            config: Arc::new(config),
            ..(*state).clone()
        })
    }

    #[tokio::test]
    async fn test_init_creates_session_and_reports_missing_key() {
        let store = Arc::new(MemoryStore::new());
        let mut client = Client::connect(test_state(store.clone()));

        client.send(json!({"type": "init", "user_id": "alice"})).await;
        let initialized = client.next().await;
        assert_eq!(initialized["type"], "initialized");
        assert_eq!(initialized["history"], json!([]));

        let session_id: Uuid =
            serde_json::from_value(initialized["session_id"].clone()).unwrap();
        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.owner_id.as_deref(), Some("alice"));

        client.send(json!({"type": "start"})).await;
        let error = client.next_of_type("error").await;
        assert_eq!(error["retryable"], false);

        client.close().await;
    }

    #[tokio::test]
    async fn test_init_with_unknown_session_fails() {
        let mut client = Client::connect(test_state(Arc::new(MemoryStore::new())));
        client
            .send(json!({"type": "init", "session_id": Uuid::new_v4()}))
            .await;
        let error = client.next().await;
        assert_eq!(error["type"], "error");
        assert!(error["message"].as_str().unwrap().contains("not found"));
        client.served.await.unwrap();
    }

    #[tokio::test]
    async fn test_resumed_session_replays_history_and_persists_typed_text() {
        let store = Arc::new(MemoryStore::new());
        let session = store.create_session(Some("alice".to_string())).await.unwrap();
        for (role, text) in [(Role::User, "Lofts in Soho?"), (Role::Model, "Here are two.")] {
            store
                .append_turn(session.id, &Turn::complete(session.id, role, text))
                .await
                .unwrap();
        }
        let transport = Arc::new(AcceptingTransport::default());
        let mut client = Client::connect(state_with(store.clone(), transport.clone()));

        client
            .send(json!({"type": "init", "session_id": session.id, "user_id": "alice"}))
            .await;
        let initialized = client.next().await;
        assert_eq!(initialized["history"].as_array().unwrap().len(), 2);

        client.send(json!({"type": "start"})).await;
        loop {
            let state = client.next_of_type("connection_state").await;
            if state["state"] == "active" {
                break;
            }
        }
        client
            .send(json!({"type": "user_message", "text": "Save the first one"}))
            .await;
        let turn = client.next_of_type("turn").await;
        assert_eq!(turn["turn"]["content"], "Save the first one");

        let mut remote = transport.remotes.lock().unwrap().remove(0);
        assert_eq!(remote.setup.history.len(), 2);
        assert!(remote.setup.tools.iter().any(|t| t.name == "save_favorite"));
        assert_eq!(
            remote.outbound.recv().await,
            Some(Outbound::Text("Save the first one".to_string()))
        );

        client.close().await;
        let turns = store.load_session(session.id).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[2].content, "Save the first one");
    }

    #[tokio::test]
    async fn test_user_message_after_stop_asks_to_restart() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(AcceptingTransport::default());
        let mut client = Client::connect(state_with(store, transport));

        client.send(json!({"type": "init"})).await;
        client.next_of_type("initialized").await;
        client.send(json!({"type": "stop"})).await;
        loop {
            let state = client.next_of_type("connection_state").await;
            if state["state"] == "closed" {
                break;
            }
        }
        // Give the bridge a moment to observe the finished session.
        tokio::time::sleep(Duration::from_millis(50)).await;

        client
            .send(json!({"type": "user_message", "text": "hello?"}))
            .await;
        let error = client.next_of_type("error").await;
        assert_eq!(error["retryable"], true);

        client.send(json!({"type": "start"})).await;
        loop {
            let state = client.next_of_type("connection_state").await;
            if state["state"] == "active" {
                break;
            }
        }
        client.close().await;
    }

    async fn wait_for_state(client: &mut Client, state: &str) {
        loop {
            if client.next_of_type("connection_state").await["state"] == state {
                return;
            }
        }
    }

    async fn next_set_markers(client: &mut Client) -> Value {
        loop {
            let msg = client.next_of_type("viewport").await;
            if msg["command"] == "set_markers" {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_markers_are_restored_when_the_session_restarts() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(AcceptingTransport::default());
        let mut client = Client::connect(state_with(store, transport.clone()));

        client.send(json!({"type": "init"})).await;
        client.next_of_type("initialized").await;
        client.send(json!({"type": "viewport_ready"})).await;
        client.send(json!({"type": "start"})).await;
        wait_for_state(&mut client, "active").await;

        let inbound = transport.remotes.lock().unwrap()[0].inbound.clone();
        inbound
            .send(LiveEvent::ToolCall(ToolCall {
                id: "call-1".to_string(),
                name: "show_properties".to_string(),
                args: json!({
                    "properties": [
                        { "id": "p1", "name": "Sidra Villa", "latitude": 25.1124, "longitude": 55.2389 }
                    ]
                }),
            }))
            .await
            .unwrap();
        let shown = next_set_markers(&mut client).await;
        assert_eq!(shown["markers"][0]["id"], "p1");

        client.send(json!({"type": "stop"})).await;
        wait_for_state(&mut client, "closed").await;
        // Give the bridge a moment to observe the finished session.
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.send(json!({"type": "start"})).await;
        let restored = next_set_markers(&mut client).await;
        assert_eq!(restored["markers"], shown["markers"]);
        client.close().await;
    }
}
