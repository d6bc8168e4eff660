//! Collaborator interfaces for the messaging core
//!
//! The core is written against these traits only; the in-memory
//! implementations in this crate are one possible backend. All concurrency
//! control the core relies on (compare-and-set status updates,
//! create-if-absent conversation creation) is the store's responsibility.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::records::{ChatRequest, Conversation, Message, NewChatRequest, PushNotification, RequestStatus};

/// Failures surfaced by the collaborator stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given id
    #[error("record not found: {0}")]
    NotFound(String),

    /// A compare-and-set update observed a different stored value
    #[error("conflict updating {0}: stored value changed concurrently")]
    Conflict(String),

    /// The backend is temporarily unreachable; safe to retry
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence adapter for chat-request records
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request as `Pending`, assigning its id and timestamp
    async fn create(&self, request: NewChatRequest) -> Result<ChatRequest>;

    /// Fetch a request by id
    async fn get(&self, id: &str) -> Result<Option<ChatRequest>>;

    /// All requests in which the participant is sender or receiver
    async fn list_by_participant(&self, participant_id: &str) -> Result<Vec<ChatRequest>>;

    /// Compare-and-set status transition.
    ///
    /// Fails with [`StoreError::Conflict`] when the stored status is not
    /// `expected`, which is how concurrent respond races are resolved:
    /// exactly one caller's transition lands.
    async fn update_status(
        &self,
        id: &str,
        expected: RequestStatus,
        new: RequestStatus,
    ) -> Result<ChatRequest>;
}

/// Persistence adapter for conversations and per-participant conversation lists
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation for `request_id`, or return the existing one.
    ///
    /// Idempotent on the request id: concurrent or retried calls all resolve
    /// to the same stored conversation.
    async fn create_if_absent(
        &self,
        request_id: &str,
        participant_ids: [String; 2],
    ) -> Result<Conversation>;

    /// Add a conversation to a participant's conversation list (set
    /// semantics: re-appending an existing entry is a no-op)
    async fn append_participant_conversation(
        &self,
        participant_id: &str,
        conversation_id: &str,
    ) -> Result<()>;

    /// Conversation ids on a participant's list
    async fn conversations_for(&self, participant_id: &str) -> Result<Vec<String>>;
}

/// Persistence adapter for messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning id and creation timestamp.
    ///
    /// Timestamps are monotonic per store; ids are creation-ordered.
    async fn append(&self, conversation_id: &str, sender_id: &str, body: &str)
        -> Result<Message>;

    /// Up to `limit` most recent messages of a conversation, returned in
    /// `(created_at, id)` ascending order
    async fn list(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Mark a message read. Idempotent; the flag never reverts.
    async fn set_read(&self, message_id: &str) -> Result<()>;
}

/// Live feed of newly appended messages
#[async_trait]
pub trait MessageFeed: Send + Sync {
    /// Open a subscription to messages appended to `conversation_id`
    async fn subscribe(&self, conversation_id: &str) -> Result<Subscription>;
}

/// A cancellable stream of feed messages.
///
/// Replaces the retained-closure callback style: the consumer pulls with
/// [`Subscription::next`] and releases the feed with [`Subscription::close`]
/// (or by dropping the subscription).
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<Message>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Assemble a subscription from its delivery channel and cancel handle
    pub fn new(events: mpsc::Receiver<Message>, cancel: oneshot::Sender<()>) -> Self {
        Self { events, cancel: Some(cancel) }
    }

    /// Next feed message. `None` means the feed was lost or the
    /// subscription was closed.
    pub async fn next(&mut self) -> Option<Message> {
        if self.cancel.is_none() {
            return None;
        }
        self.events.recv().await
    }

    /// Release the subscription. Idempotent; no messages are delivered
    /// after close.
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Whether the subscription has been closed locally
    pub fn is_closed(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Best-effort push notification sender.
///
/// Callers treat delivery as fire-and-forget: failures are logged and
/// swallowed, never propagated as operation failures.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver a notification to its targets
    async fn notify(&self, notification: PushNotification) -> Result<()>;
}
