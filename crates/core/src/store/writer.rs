use super::ConversationStore;
use crate::conversation::Turn;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// A turn that could not be persisted.
#[derive(Debug, Clone)]
pub struct PersistFailure {
    pub turn_id: Uuid,
    pub message: String,
}

/// Appends final turns of one session on a background task.
///
/// `append` never blocks the caller. Turns are written strictly in the order
/// they were handed over, one at a time, so concurrent finalisation cannot
/// reorder the transcript.
pub struct TurnWriter {
    tx: mpsc::UnboundedSender<Turn>,
    handle: JoinHandle<()>,
}

impl TurnWriter {
    pub fn spawn(
        session_id: Uuid,
        store: Arc<dyn ConversationStore>,
        failures: Option<mpsc::UnboundedSender<PersistFailure>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Turn>();
        let handle = tokio::spawn(
            async move {
                while let Some(turn) = rx.recv().await {
                    match store.append_turn(session_id, &turn).await {
                        Ok(()) => debug!(turn_id = %turn.id, role = %turn.role, "Turn persisted"),
                        Err(e) => {
                            warn!(turn_id = %turn.id, error = %e, "Failed to persist turn");
                            if let Some(failures) = &failures {
                                let _ = failures.send(PersistFailure {
                                    turn_id: turn.id,
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("turn_writer", %session_id)),
        );
        Self { tx, handle }
    }

    pub fn append(&self, turn: Turn) {
        if self.tx.send(turn).is_err() {
            warn!("Turn writer task is gone, dropping turn");
        }
    }

    /// Waits until every queued turn has been written.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Turn writer task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::store::{MemoryStore, MockConversationStore, StoreError};
    use mockall::Sequence;

    #[tokio::test]
    async fn test_turns_written_in_order_and_flushed_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let session = store.create_session(None).await.unwrap();
        let writer = TurnWriter::spawn(session.id, store.clone(), None);
        for i in 0..20 {
            writer.append(Turn::complete(session.id, Role::User, format!("turn {i}")));
        }
        writer.shutdown().await;

        let loaded = store.load_session(session.id).await.unwrap();
        assert_eq!(loaded.len(), 20);
        for (i, turn) in loaded.iter().enumerate() {
            assert_eq!(turn.content, format!("turn {i}"));
        }
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_writing_continues() {
        let session_id = Uuid::new_v4();
        let mut store = MockConversationStore::new();
        let mut seq = Sequence::new();
        store
            .expect_append_turn()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StoreError::Backend("connection reset".to_string())));
        store
            .expect_append_turn()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let writer = TurnWriter::spawn(session_id, Arc::new(store), Some(failures_tx));
        let first = Turn::complete(session_id, Role::User, "one");
        let first_id = first.id;
        writer.append(first);
        writer.append(Turn::complete(session_id, Role::Model, "two"));
        writer.shutdown().await;

        let failure = failures_rx.recv().await.unwrap();
        assert_eq!(failure.turn_id, first_id);
        assert!(failure.message.contains("connection reset"));
        assert!(failures_rx.try_recv().is_err());
    }
}
