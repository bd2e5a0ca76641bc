use super::{AudioBuffer, ConnectionState, LiveError, LiveEvent, Outbound, validate_transition};
use crate::Command;
use crate::conversation::{Role, Turn};
use crate::tools::ToolResult;
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The connection state machine and turn assembler of one session.
///
/// Every method consumes one event and returns the side effects to perform,
/// in order. Nothing here touches a socket, a clock or the store.
#[derive(Debug)]
pub struct Orchestrator {
    session_id: Uuid,
    state: ConnectionState,
    credential_present: bool,
    buffer: AudioBuffer,
    user_turn: Option<Turn>,
    model_turn: Option<Turn>,
    /// Set after a local interrupt; the rest of the cancelled response is
    /// discarded until the remote ends the turn.
    muted: bool,
}

impl Orchestrator {
    pub fn new(session_id: Uuid, credential_present: bool, audio_buffer_frames: usize) -> Self {
        Self {
            session_id,
            state: ConnectionState::Idle,
            credential_present,
            buffer: AudioBuffer::new(audio_buffer_frames),
            user_turn: None,
            model_turn: None,
            muted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// The model turn currently being streamed.
    pub fn model_turn(&self) -> Option<&Turn> {
        self.model_turn.as_ref()
    }

    pub fn user_turn(&self) -> Option<&Turn> {
        self.user_turn.as_ref()
    }

    /// Starts (or retries after an error) the session.
    pub fn start(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        if !self.enter(ConnectionState::Connecting, &mut commands) {
            return commands;
        }
        if !self.credential_present {
            self.fail(&LiveError::MissingCredential, &mut commands);
            return commands;
        }
        commands.push(Command::Connect);
        commands
    }

    /// The transport confirmed a (re)connection.
    pub fn on_connected(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        match self.state {
            ConnectionState::Connecting => {
                self.enter(ConnectionState::Active, &mut commands);
            }
            ConnectionState::Suspended => {
                self.enter(ConnectionState::Active, &mut commands);
                let frames = self.buffer.drain();
                info!(frames = frames.len(), "Link restored, flushing buffered audio");
                commands.extend(
                    frames
                        .into_iter()
                        .map(|frame| Command::Send(Outbound::Audio(frame))),
                );
            }
            other => {
                debug!(state = %other, "Link opened after the session moved on, dropping it");
                commands.push(Command::Disconnect);
            }
        }
        commands
    }

    /// Connecting, or every reconnect attempt, failed.
    pub fn on_connect_failed(&mut self, error: LiveError) -> Vec<Command> {
        let mut commands = Vec::new();
        match self.state {
            ConnectionState::Connecting | ConnectionState::Suspended => {
                self.fail(&error, &mut commands);
            }
            other => debug!(state = %other, error = %error, "Ignoring late connect failure"),
        }
        commands
    }

    /// A microphone frame from the client.
    pub fn on_audio(&mut self, frame: Bytes) -> Vec<Command> {
        match self.state {
            ConnectionState::Active => vec![Command::Send(Outbound::Audio(frame))],
            ConnectionState::Suspended => {
                if self.buffer.push(frame) {
                    debug!(dropped = self.buffer.dropped(), "Audio buffer full, dropped oldest frame");
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Typed text is a user turn that is complete on arrival.
    pub fn on_user_text(&mut self, text: &str) -> Vec<Command> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if self.state != ConnectionState::Active {
            return vec![Command::ReportError {
                message: "The assistant is not connected".to_string(),
                retryable: true,
            }];
        }
        let mut commands = Vec::new();
        self.finalize_user(&mut commands);
        let turn = Turn::complete(self.session_id, Role::User, text);
        commands.push(Command::ShowTurn(turn.clone()));
        commands.push(Command::Persist(turn));
        commands.push(Command::Send(Outbound::Text(text.to_string())));
        commands
    }

    pub fn on_live_event(&mut self, event: LiveEvent) -> Vec<Command> {
        if self.state != ConnectionState::Active {
            debug!(state = %self.state, ?event, "Ignoring live event outside an active link");
            return Vec::new();
        }
        let mut commands = Vec::new();
        match event {
            LiveEvent::InputTranscript(delta) => {
                let session_id = self.session_id;
                let turn = self
                    .user_turn
                    .get_or_insert_with(|| Turn::partial(session_id, Role::User));
                turn.push_text(&delta);
                commands.push(Command::ShowTurn(turn.clone()));
            }
            LiveEvent::OutputText(delta) => {
                if self.muted {
                    return commands;
                }
                self.finalize_user(&mut commands);
                let turn = self.model_turn_mut();
                turn.push_text(&delta);
                commands.push(Command::ShowTurn(turn.clone()));
            }
            LiveEvent::Audio(chunk) => {
                if self.muted {
                    return commands;
                }
                self.finalize_user(&mut commands);
                self.model_turn_mut();
                commands.push(Command::PlayAudio(chunk));
            }
            LiveEvent::Sources(sources) => {
                if self.muted {
                    return commands;
                }
                let turn = self.model_turn_mut();
                for source in sources {
                    if !turn.sources.contains(&source) {
                        turn.sources.push(source);
                    }
                }
                commands.push(Command::ShowTurn(turn.clone()));
            }
            LiveEvent::ToolCall(call) => {
                // The remote waits for an answer even for a cancelled
                // response, so calls are dispatched while muted too.
                self.finalize_user(&mut commands);
                let turn = self.model_turn_mut();
                turn.mark_tool(&call.name);
                commands.push(Command::ShowTurn(turn.clone()));
                commands.push(Command::Dispatch(call));
            }
            LiveEvent::TurnComplete => {
                self.muted = false;
                self.finalize_all(&mut commands);
            }
            LiveEvent::Interrupted => {
                info!("Remote reported barge-in");
                commands.push(Command::StopPlayback);
                self.finalize_model(true, &mut commands);
            }
            LiveEvent::Dropped { reason } => {
                warn!(%reason, "Live link dropped, suspending");
                self.muted = false;
                commands.push(Command::StopPlayback);
                self.finalize_all(&mut commands);
                self.enter(ConnectionState::Suspended, &mut commands);
                commands.push(Command::Reconnect);
            }
            LiveEvent::Ended => {
                info!("Remote ended the session");
                self.close(&mut commands);
            }
            LiveEvent::Failed(error) => {
                self.fail(&error, &mut commands);
            }
        }
        commands
    }

    /// A tool finished; its result goes back to the remote while the link
    /// is up and is dropped otherwise.
    pub fn on_tool_result(&mut self, result: ToolResult) -> Vec<Command> {
        if self.state != ConnectionState::Active {
            debug!(call_id = %result.id, state = %self.state, "Dropping tool result, link not active");
            return Vec::new();
        }
        vec![Command::Send(Outbound::ToolResponse(result))]
    }

    /// User barge-in (button or typing over the model).
    pub fn interrupt(&mut self) -> Vec<Command> {
        if self.state != ConnectionState::Active {
            return Vec::new();
        }
        let mut commands = vec![Command::StopPlayback];
        if self.model_turn.is_some() {
            self.finalize_model(true, &mut commands);
            self.muted = true;
            commands.push(Command::Send(Outbound::CancelResponse));
        }
        commands
    }

    pub fn stop(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.state == ConnectionState::Closed {
            return commands;
        }
        self.close(&mut commands);
        commands
    }

    fn close(&mut self, commands: &mut Vec<Command>) {
        self.muted = false;
        self.buffer.clear();
        commands.push(Command::StopPlayback);
        self.finalize_all(commands);
        self.enter(ConnectionState::Closed, commands);
        commands.push(Command::Disconnect);
    }

    fn fail(&mut self, error: &LiveError, commands: &mut Vec<Command>) {
        warn!(error = %error, "Live session failed");
        self.muted = false;
        self.buffer.clear();
        commands.push(Command::StopPlayback);
        self.finalize_all(commands);
        self.enter(ConnectionState::Error, commands);
        commands.push(Command::Disconnect);
        commands.push(Command::ReportError {
            message: error.to_string(),
            retryable: *error != LiveError::MissingCredential,
        });
    }

    fn enter(&mut self, to: ConnectionState, commands: &mut Vec<Command>) -> bool {
        match validate_transition(self.state, to) {
            Ok(()) => {
                info!(from = %self.state, to = %to, "Connection state changed");
                self.state = to;
                commands.push(Command::StateChanged(to));
                true
            }
            Err(e) => {
                warn!(error = %e, "Rejected connection state change");
                false
            }
        }
    }

    fn model_turn_mut(&mut self) -> &mut Turn {
        let session_id = self.session_id;
        self.model_turn
            .get_or_insert_with(|| Turn::partial(session_id, Role::Model))
    }

    fn finalize_all(&mut self, commands: &mut Vec<Command>) {
        self.finalize_user(commands);
        self.finalize_model(false, commands);
    }

    fn finalize_user(&mut self, commands: &mut Vec<Command>) {
        if let Some(turn) = self.user_turn.take() {
            finalize(turn, false, commands);
        }
    }

    fn finalize_model(&mut self, interrupted: bool, commands: &mut Vec<Command>) {
        if let Some(turn) = self.model_turn.take() {
            finalize(turn, interrupted, commands);
        }
    }
}

/// Promotes a partial turn to final. Empty turns are discarded.
fn finalize(mut turn: Turn, interrupted: bool, commands: &mut Vec<Command>) {
    if turn.is_empty() {
        debug!(turn_id = %turn.id, role = %turn.role, "Discarding empty turn");
        return;
    }
    turn.is_final = true;
    turn.interrupted = interrupted;
    commands.push(Command::ShowTurn(turn.clone()));
    commands.push(Command::Persist(turn));
}
