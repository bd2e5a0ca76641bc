pub mod config;
pub mod conversation;
pub mod geometry;
pub mod live;
pub mod map;
pub mod store;
pub mod tools;

pub use config::{LiveConfig, ReconnectPolicy};

use bytes::Bytes;
use conversation::Turn;
use live::{ConnectionState, Outbound};
use tools::ToolCall;

/// Represents commands that the core logic issues to an external runtime.
///
/// This enum is the primary API for decoupling the orchestrator's decisions
/// from the runtime's execution of side effects (opening links, sending to
/// the remote model, running tools, persisting turns, talking to the client).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open the first link to the remote model.
    Connect,
    /// Re-open a dropped link, with backoff.
    Reconnect,
    /// Drop the current link, if any.
    Disconnect,
    Send(Outbound),
    /// Run a tool call; its result comes back through the orchestrator.
    Dispatch(ToolCall),
    /// Hand a final turn to the turn writer.
    Persist(Turn),
    /// Publish a turn (partial or final) to the client.
    ShowTurn(Turn),
    PlayAudio(Bytes),
    StopPlayback,
    StateChanged(ConnectionState),
    ReportError { message: String, retryable: bool },
}
