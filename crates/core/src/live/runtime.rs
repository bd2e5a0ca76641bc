use super::{
    ConnectionState, Credential, LiveError, LiveEvent, LiveLink, LiveTransport, Orchestrator,
    SessionSetup,
};
use crate::conversation::Turn;
use crate::geometry::{GeometryResolver, LayoutSnapshot};
use crate::map::{MapChoreographer, MapRequest, Marker, ViewState, Viewport, ViewportCommand};
use crate::store::{ConversationStore, PersistFailure, TurnWriter};
use crate::tools::{MapToolHandler, ToolDispatcher, ToolRegistry, ToolResult};
use crate::{Command, LiveConfig, ReconnectPolicy};
use bytes::Bytes;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// What the client can ask of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Start,
    Stop,
    Interrupt,
    UserText(String),
    /// PCM16 microphone audio at the remote's input rate.
    Audio(Bytes),
    Layout(LayoutSnapshot),
    ViewportReady,
    ViewportLost,
    /// The user moved the camera by hand.
    CameraMoved,
    TransitionFinished(u64),
}

/// What a running session tells the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    State(ConnectionState),
    Turn(Turn),
    Audio(Bytes),
    StopPlayback,
    Viewport(ViewportCommand),
    Error { message: String, retryable: bool },
    /// A non-fatal problem, e.g. a turn that could not be saved.
    Warning(String),
}

/// Queues viewport commands for the runtime, which forwards every one of
/// them to the client after the current event is handled.
struct QueuedViewport {
    commands: mpsc::UnboundedSender<ViewportCommand>,
}

impl Viewport for QueuedViewport {
    fn submit(&mut self, command: ViewportCommand) {
        if self.commands.send(command).is_err() {
            debug!("Runtime gone, viewport command dropped");
        }
    }
}

/// A live conversation bound to one client connection.
pub struct LiveSession {
    session_id: Uuid,
    config: LiveConfig,
    transport: Arc<dyn LiveTransport>,
    credential: Option<Credential>,
    store: Arc<dyn ConversationStore>,
    tools: ToolRegistry,
    setup: SessionSetup,
    markers: Vec<Marker>,
}

impl LiveSession {
    pub fn new(
        session_id: Uuid,
        config: LiveConfig,
        transport: Arc<dyn LiveTransport>,
        credential: Option<Credential>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            session_id,
            config,
            transport,
            credential,
            store,
            tools: ToolRegistry::new(),
            setup: SessionSetup::default(),
            markers: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.setup.instructions = instructions.into();
        self
    }

    /// Extra tools besides the map tools, which are always registered.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Turns of a resumed conversation, replayed to the remote as context.
    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.setup.history = history;
        self
    }

    /// Markers the client still shows from an earlier session. They are
    /// re-sent once a viewport attaches, without moving the camera.
    pub fn with_markers(mut self, markers: Vec<Marker>) -> Self {
        self.markers = markers;
        self
    }

    /// Drives the session until it closes or `inputs` ends, then returns the
    /// final map view.
    pub async fn run(
        self,
        inputs: mpsc::Receiver<SessionInput>,
        output: mpsc::Sender<SessionOutput>,
    ) -> ViewState {
        let span = info_span!("live_session", session_id = %self.session_id);
        Runtime::new(self, output).run(inputs).instrument(span).await
    }
}

type ConnectTask = JoinHandle<Result<LiveLink, LiveError>>;

struct Runtime {
    config: LiveConfig,
    transport: Arc<dyn LiveTransport>,
    credential: Option<Credential>,
    setup: SessionSetup,
    orchestrator: Orchestrator,
    map: MapChoreographer,
    geometry: GeometryResolver,
    dispatcher: ToolDispatcher,
    writer: TurnWriter,
    output: mpsc::Sender<SessionOutput>,
    viewport_tx: mpsc::UnboundedSender<ViewportCommand>,
    viewport_rx: mpsc::UnboundedReceiver<ViewportCommand>,
    link: Option<LiveLink>,
    connecting: Option<ConnectTask>,
    settle: Option<Pin<Box<Sleep>>>,
    map_rx: mpsc::Receiver<MapRequest>,
    results_tx: mpsc::UnboundedSender<ToolResult>,
    results_rx: mpsc::UnboundedReceiver<ToolResult>,
    failures_rx: mpsc::UnboundedReceiver<PersistFailure>,
}

impl Runtime {
    fn new(session: LiveSession, output: mpsc::Sender<SessionOutput>) -> Self {
        let LiveSession {
            session_id,
            config,
            transport,
            credential,
            store,
            tools,
            mut setup,
            markers,
        } = session;

        let (map_tx, map_rx) = mpsc::channel(32);
        let registry = tools.register(Arc::new(MapToolHandler::new(map_tx)));
        setup.tools = registry.declarations();

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (viewport_tx, viewport_rx) = mpsc::unbounded_channel();
        let mut map = MapChoreographer::new(config.framing);
        map.restore(markers);

        Self {
            orchestrator: Orchestrator::new(
                session_id,
                credential.is_some(),
                config.audio_buffer_frames,
            ),
            map,
            geometry: GeometryResolver::new(config.geometry),
            dispatcher: ToolDispatcher::new(Arc::new(registry), config.tool_timeout),
            writer: TurnWriter::spawn(session_id, store, Some(failures_tx)),
            config,
            transport,
            credential,
            setup,
            output,
            viewport_tx,
            viewport_rx,
            link: None,
            connecting: None,
            settle: None,
            map_rx,
            results_tx,
            results_rx,
            failures_rx,
        }
    }

    async fn run(mut self, mut inputs: mpsc::Receiver<SessionInput>) -> ViewState {
        info!("Live session runtime started");
        loop {
            let commands = tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => {
                        debug!("Client input closed");
                        self.orchestrator.stop()
                    }
                },
                event = recv_link(&mut self.link) => {
                    let link_over = matches!(
                        event,
                        LiveEvent::Dropped { .. } | LiveEvent::Ended | LiveEvent::Failed(_)
                    );
                    let commands = self.orchestrator.on_live_event(event);
                    if link_over {
                        self.link = None;
                    }
                    commands
                },
                connected = join_connect(&mut self.connecting) => match connected {
                    Ok(link) => {
                        self.link = Some(link);
                        self.orchestrator.on_connected()
                    }
                    Err(e) => self.orchestrator.on_connect_failed(e),
                },
                Some(result) = self.results_rx.recv() => self.orchestrator.on_tool_result(result),
                Some(request) = self.map_rx.recv() => {
                    self.map.handle(request);
                    Vec::new()
                },
                Some(failure) = self.failures_rx.recv() => {
                    self.emit(SessionOutput::Warning(format!(
                        "Part of the conversation could not be saved: {}",
                        failure.message
                    )))
                    .await;
                    Vec::new()
                },
                _ = settle_timer(&mut self.settle) => {
                    self.settle = None;
                    let insets = self.geometry.settle();
                    debug!(?insets, "Layout settled");
                    self.map.set_insets(insets);
                    Vec::new()
                },
            };

            self.execute(commands).await;
            self.flush_viewport().await;
            if self.orchestrator.state() == ConnectionState::Closed {
                break;
            }
        }

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.link = None;
        self.writer.shutdown().await;
        info!("Live session runtime finished");
        self.map.view_state().clone()
    }

    fn handle_input(&mut self, input: SessionInput) -> Vec<Command> {
        match input {
            SessionInput::Start => self.orchestrator.start(),
            SessionInput::Stop => self.orchestrator.stop(),
            SessionInput::Interrupt => self.orchestrator.interrupt(),
            SessionInput::UserText(text) => self.orchestrator.on_user_text(&text),
            SessionInput::Audio(frame) => self.orchestrator.on_audio(frame),
            SessionInput::Layout(layout) => {
                if self.geometry.is_settled() {
                    if let Some(insets) = self.geometry.observe(layout) {
                        debug!(?insets, "Insets changed");
                        self.map.set_insets(insets);
                    }
                } else {
                    self.geometry.observe(layout);
                    if self.settle.is_none() {
                        self.settle = Some(Box::pin(tokio::time::sleep(
                            self.config.layout_settle_delay,
                        )));
                    }
                }
                Vec::new()
            }
            SessionInput::ViewportReady => {
                self.map.attach(Box::new(QueuedViewport {
                    commands: self.viewport_tx.clone(),
                }));
                self.map.resync();
                Vec::new()
            }
            SessionInput::ViewportLost => {
                self.map.detach();
                Vec::new()
            }
            SessionInput::CameraMoved => {
                self.map.on_camera_interaction();
                Vec::new()
            }
            SessionInput::TransitionFinished(id) => {
                self.map.on_transition_finished(id);
                Vec::new()
            }
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Connect => {
                    let transport = self.transport.clone();
                    let credential = self.credential.clone();
                    let setup = self.setup.clone();
                    let timeout = self.config.handshake_timeout;
                    self.connecting = Some(tokio::spawn(async move {
                        let credential = credential.ok_or(LiveError::MissingCredential)?;
                        connect_once(transport.as_ref(), &credential, &setup, timeout).await
                    }));
                }
                Command::Reconnect => {
                    self.link = None;
                    let transport = self.transport.clone();
                    let credential = self.credential.clone();
                    let setup = self.setup.clone();
                    let timeout = self.config.handshake_timeout;
                    let policy = self.config.reconnect;
                    self.connecting = Some(tokio::spawn(async move {
                        let credential = credential.ok_or(LiveError::MissingCredential)?;
                        reconnect_with_backoff(transport.as_ref(), &credential, &setup, timeout, &policy)
                            .await
                    }));
                }
                Command::Disconnect => {
                    if let Some(task) = self.connecting.take() {
                        task.abort();
                    }
                    if self.link.take().is_some() {
                        debug!("Live link released");
                    }
                }
                Command::Send(message) => match &self.link {
                    Some(link) => {
                        if link.outbound.send(message).await.is_err() {
                            warn!("Live link writer is gone, message dropped");
                        }
                    }
                    None => debug!("No live link, message dropped"),
                },
                Command::Dispatch(call) => {
                    let execution = self.dispatcher.dispatch(call);
                    let results = self.results_tx.clone();
                    tokio::spawn(async move {
                        let _ = results.send(execution.await);
                    });
                }
                Command::Persist(turn) => {
                    // Later reconnects replay the conversation so far.
                    self.setup.history.push(turn.clone());
                    self.writer.append(turn);
                }
                Command::ShowTurn(turn) => self.emit(SessionOutput::Turn(turn)).await,
                Command::PlayAudio(chunk) => self.emit(SessionOutput::Audio(chunk)).await,
                Command::StopPlayback => self.emit(SessionOutput::StopPlayback).await,
                Command::StateChanged(state) => self.emit(SessionOutput::State(state)).await,
                Command::ReportError { message, retryable } => {
                    self.emit(SessionOutput::Error { message, retryable }).await
                }
            }
        }
    }

    /// Viewport commands share the client channel with audio; they wait for
    /// room instead of being dropped.
    async fn flush_viewport(&mut self) {
        while let Ok(command) = self.viewport_rx.try_recv() {
            self.emit(SessionOutput::Viewport(command)).await;
        }
    }

    async fn emit(&self, message: SessionOutput) {
        if self.output.send(message).await.is_err() {
            debug!("Client output closed");
        }
    }
}

async fn recv_link(link: &mut Option<LiveLink>) -> LiveEvent {
    match link {
        Some(link) => link.inbound.recv().await.unwrap_or(LiveEvent::Dropped {
            reason: "live link closed".to_string(),
        }),
        None => pending().await,
    }
}

async fn join_connect(task: &mut Option<ConnectTask>) -> Result<LiveLink, LiveError> {
    let Some(handle) = task else {
        return pending().await;
    };
    let joined = handle.await;
    *task = None;
    joined.unwrap_or_else(|e| Err(LiveError::Transport(format!("connect task failed: {e}"))))
}

async fn settle_timer(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn connect_once(
    transport: &dyn LiveTransport,
    credential: &Credential,
    setup: &SessionSetup,
    timeout: Duration,
) -> Result<LiveLink, LiveError> {
    tokio::time::timeout(timeout, transport.connect(credential, setup))
        .await
        .map_err(|_| LiveError::HandshakeTimeout(timeout))?
}

async fn reconnect_with_backoff(
    transport: &dyn LiveTransport,
    credential: &Credential,
    setup: &SessionSetup,
    timeout: Duration,
    policy: &ReconnectPolicy,
) -> Result<LiveLink, LiveError> {
    let mut last_error = LiveError::Transport("no reconnect attempts configured".to_string());
    for attempt in 1..=policy.max_attempts {
        let backoff = policy.backoff_for_attempt(attempt);
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            "Attempting live reconnect"
        );
        tokio::time::sleep(backoff).await;

        match connect_once(transport, credential, setup, timeout).await {
            Ok(link) => {
                info!(attempt, "Live reconnect succeeded");
                return Ok(link);
            }
            Err(e) if !e.is_transient() => {
                warn!(attempt, error = %e, "Live reconnect rejected, giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Live reconnect attempt failed");
                last_error = e;
            }
        }
    }
    warn!(max_attempts = policy.max_attempts, "Live reconnect attempts exhausted");
    Err(last_error)
}
