//! Reconciling a streamed assistant reply with its persisted message
//!
//! While a reply streams in it is shown as an *in-flight* message under a
//! temporary identifier. Once the full text is persisted the in-flight entry is
//! swapped for the durable message in a single update, so observers never see
//! the reply vanish and reappear.
//!
//! ```text
//! Idle --begin--> Streaming --finish--> Completed
//!   |                 |
//!   +-----abort-------+-----abort-----> Aborted
//! ```

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{ChatMessage, MessageId, Role, TempId};

/// Source of temporary identifiers for in-flight messages.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> TempId;
}

/// Sequential `temp-1`, `temp-2`, ... identifiers.
#[derive(Debug, Default)]
pub struct CounterIdSource {
    next: AtomicU64,
}

impl CounterIdSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for CounterIdSource {
    fn next_id(&self) -> TempId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        TempId(format!("temp-{n}"))
    }
}

/// Random `temp-<uuid>` identifiers, unique across sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn next_id(&self) -> TempId {
        TempId(format!("temp-{}", Uuid::new_v4()))
    }
}

/// The ordered set of messages visible to the display layer.
///
/// Cloning a `Transcript` shares the same set. Every mutation is published as
/// one snapshot to subscribers.
#[derive(Debug, Clone)]
pub struct Transcript {
    tx: Arc<watch::Sender<Vec<ChatMessage>>>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.tx.subscribe()
    }

    /// Snapshots as a stream, starting with the current contents.
    pub fn updates(&self) -> WatchStream<Vec<ChatMessage>> {
        WatchStream::new(self.subscribe())
    }

    pub fn replace_all(&self, messages: Vec<ChatMessage>) {
        self.tx.send_replace(messages);
    }

    pub fn clear(&self) {
        self.replace_all(Vec::new());
    }

    pub fn push(&self, message: ChatMessage) {
        self.tx.send_modify(|messages| {
            // A message delivered twice (e.g. by a realtime feed) is shown once.
            if !messages.iter().any(|m| m.id == message.id) {
                messages.push(message);
            }
        });
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.tx.borrow().iter().any(|m| &m.id == id)
    }

    fn modify(&self, f: impl FnOnce(&mut Vec<ChatMessage>)) {
        self.tx.send_modify(f);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Streaming,
    Completed,
    Aborted,
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcilerState::Idle => "idle",
            ReconcilerState::Streaming => "streaming",
            ReconcilerState::Completed => "completed",
            ReconcilerState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot {operation} while {state}")]
pub struct ReconcileError {
    pub operation: &'static str,
    pub state: ReconcilerState,
}

/// Owns the in-flight assistant message of one send operation.
#[derive(Debug)]
pub struct MessageReconciler {
    transcript: Transcript,
    state: ReconcilerState,
    temp_id: Option<TempId>,
    text: String,
}

impl MessageReconciler {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            state: ReconcilerState::Idle,
            temp_id: None,
            text: String::new(),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn temp_id(&self) -> Option<&TempId> {
        self.temp_id.as_ref()
    }

    /// Insert an empty in-flight message at the tail of the transcript.
    pub fn begin(&mut self, ids: &dyn IdSource) -> Result<TempId, ReconcileError> {
        self.expect_state(ReconcilerState::Idle, "begin")?;

        let id = ids.next_id();
        self.transcript.push(ChatMessage {
            id: MessageId::Temporary(id.clone()),
            role: Role::Assistant,
            content: String::new(),
            created_at: Utc::now(),
        });
        debug!(temp_id = %id, "Streaming assistant reply");

        self.temp_id = Some(id.clone());
        self.state = ReconcilerState::Streaming;
        Ok(id)
    }

    /// Append a delta; the transcript reflects the new text on return.
    pub fn append(&mut self, delta: &str) -> Result<(), ReconcileError> {
        let id = self.in_flight("append")?;

        self.text.push_str(delta);
        let text = &self.text;
        self.transcript.modify(|messages| {
            if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
                message.content.clone_from(text);
            }
        });
        Ok(())
    }

    /// Swap the in-flight message for its persisted counterpart.
    ///
    /// The persisted message takes the in-flight message's position. If it is
    /// already present (delivered by another channel) it is not duplicated.
    pub fn finish(&mut self, persisted: ChatMessage) -> Result<(), ReconcileError> {
        let id = self.in_flight("finish")?;
        self.transcript.modify(|messages| {
            messages.retain(|m| m.id != persisted.id);
            match messages.iter().position(|m| m.id == id) {
                Some(pos) => messages[pos] = persisted,
                None => messages.push(persisted),
            }
        });

        info!(temp_id = %id, "Assistant reply persisted ({} chars)", self.text.len());
        self.state = ReconcilerState::Completed;
        Ok(())
    }

    /// Remove the in-flight message, if any, discarding the partial text.
    ///
    /// Returns the text accumulated before the abort.
    pub fn abort(&mut self, reason: &str) -> Result<String, ReconcileError> {
        match self.state {
            ReconcilerState::Idle | ReconcilerState::Streaming => {}
            state => {
                return Err(ReconcileError {
                    operation: "abort",
                    state,
                });
            }
        }

        if let Some(id) = self.temp_id.clone() {
            let id = MessageId::Temporary(id);
            self.transcript.modify(|messages| messages.retain(|m| m.id != id));
        }
        debug!("Assistant reply aborted: {}", reason);

        self.state = ReconcilerState::Aborted;
        Ok(std::mem::take(&mut self.text))
    }

    fn expect_state(
        &self,
        expected: ReconcilerState,
        operation: &'static str,
    ) -> Result<(), ReconcileError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ReconcileError {
                operation,
                state: self.state,
            })
        }
    }

    fn in_flight(&self, operation: &'static str) -> Result<MessageId, ReconcileError> {
        match (self.state, &self.temp_id) {
            (ReconcilerState::Streaming, Some(id)) => Ok(MessageId::Temporary(id.clone())),
            (state, _) => Err(ReconcileError { operation, state }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn persisted(content: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::Persisted(Uuid::new_v4()),
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    fn user_message(content: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            ..persisted(content)
        }
    }

    #[test]
    fn test_counter_ids_are_sequential() {
        let ids = CounterIdSource::new();
        assert_eq!(ids.next_id(), TempId("temp-1".into()));
        assert_eq!(ids.next_id(), TempId("temp-2".into()));
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids = UuidIdSource;
        let a = ids.next_id();
        assert!(a.0.starts_with("temp-"));
        assert_ne!(a, ids.next_id());
    }

    #[test]
    fn test_begin_inserts_empty_message_at_tail() {
        let transcript = Transcript::new();
        transcript.push(user_message("question"));
        let mut reconciler = MessageReconciler::new(transcript.clone());

        let id = reconciler.begin(&CounterIdSource::new()).unwrap();

        let messages = transcript.snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, MessageId::Temporary(id));
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].content.is_empty());
        assert_eq!(reconciler.state(), ReconcilerState::Streaming);
    }

    #[test]
    fn test_append_accumulates_visible_text() {
        let transcript = Transcript::new();
        let mut reconciler = MessageReconciler::new(transcript.clone());
        reconciler.begin(&CounterIdSource::new()).unwrap();

        reconciler.append("Hel").unwrap();
        assert_eq!(transcript.snapshot()[0].content, "Hel");
        reconciler.append("lo").unwrap();

        assert_eq!(transcript.snapshot()[0].content, "Hello");
        assert_eq!(reconciler.text(), "Hello");
    }

    #[test]
    fn test_finish_replaces_in_place() {
        let transcript = Transcript::new();
        transcript.push(user_message("q"));
        let mut reconciler = MessageReconciler::new(transcript.clone());
        let temp = reconciler.begin(&CounterIdSource::new()).unwrap();
        reconciler.append("answer").unwrap();

        let saved = persisted("answer");
        reconciler.finish(saved.clone()).unwrap();

        let messages = transcript.snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], saved);
        assert!(!transcript.contains(&MessageId::Temporary(temp)));
        assert_eq!(reconciler.state(), ReconcilerState::Completed);
    }

    #[test]
    fn test_finish_does_not_duplicate_already_delivered_message() {
        let transcript = Transcript::new();
        let mut reconciler = MessageReconciler::new(transcript.clone());
        reconciler.begin(&CounterIdSource::new()).unwrap();
        reconciler.append("text").unwrap();

        let saved = persisted("text");
        transcript.push(saved.clone());
        reconciler.finish(saved.clone()).unwrap();

        let messages = transcript.snapshot();
        assert_eq!(messages.iter().filter(|m| m.id == saved.id).count(), 1);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_abort_removes_in_flight_message() {
        let transcript = Transcript::new();
        transcript.push(user_message("q"));
        let mut reconciler = MessageReconciler::new(transcript.clone());
        reconciler.begin(&CounterIdSource::new()).unwrap();
        reconciler.append("partial").unwrap();

        let partial = reconciler.abort("connection reset").unwrap();

        assert_eq!(partial, "partial");
        assert_eq!(transcript.snapshot().len(), 1);
        assert_eq!(reconciler.state(), ReconcilerState::Aborted);
    }

    #[test]
    fn test_abort_from_idle_leaves_transcript_untouched() {
        let transcript = Transcript::new();
        transcript.push(user_message("q"));
        let before = transcript.snapshot();
        let mut reconciler = MessageReconciler::new(transcript.clone());

        reconciler.abort("upstream returned 500").unwrap();

        assert_eq!(transcript.snapshot(), before);
        assert_eq!(reconciler.state(), ReconcilerState::Aborted);
    }

    #[test]
    fn test_terminal_states_reject_further_operations() {
        let mut reconciler = MessageReconciler::new(Transcript::new());
        let ids = CounterIdSource::new();
        reconciler.begin(&ids).unwrap();
        reconciler.finish(persisted("done")).unwrap();

        let err = reconciler.append("late").unwrap_err();
        assert_eq!(err.state, ReconcilerState::Completed);
        assert!(reconciler.begin(&ids).is_err());
        assert!(reconciler.abort("late").is_err());
        assert_eq!(err.to_string(), "Cannot append while completed");
    }

    #[test]
    fn test_append_before_begin_is_rejected() {
        let mut reconciler = MessageReconciler::new(Transcript::new());
        assert!(reconciler.append("x").is_err());
        assert!(reconciler.finish(persisted("x")).is_err());
    }

    #[tokio::test]
    async fn test_subscribers_observe_updates() {
        let transcript = Transcript::new();
        let mut updates = transcript.updates();
        assert!(updates.next().await.unwrap().is_empty());

        let mut reconciler = MessageReconciler::new(transcript.clone());
        reconciler.begin(&CounterIdSource::new()).unwrap();
        reconciler.append("hi").unwrap();

        // Watch streams yield the latest snapshot.
        let latest = updates.next().await.unwrap();
        assert_eq!(latest[0].content, "hi");
    }
}
