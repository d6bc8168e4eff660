//! Idempotent conversation creation
//!
//! Turns an approved chat request into exactly one durable conversation.
//! All of the work here is safe to re-run: the store's create-if-absent
//! keys on the originating request id, participant-list appends have set
//! semantics, and the system message is only inserted into an empty
//! conversation. A caller that hit a transient failure simply calls
//! [`ConversationFactory::get_or_create`] again.

use std::sync::Arc;

use thiserror::Error;

use storage::records::{Conversation, SYSTEM_SENDER};
use storage::stores::{ConversationStore, MessageStore, StoreError};

/// Body of the system message opening every conversation
pub const CONVERSATION_STARTED: &str = "Conversation started";

/// Errors surfaced by conversation creation
#[derive(Debug, Error)]
pub enum ConversationError {
    /// Store failure; the operation is idempotent and safe to retry
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for conversation operations
pub type Result<T> = std::result::Result<T, ConversationError>;

/// Factory producing exactly one conversation per approved request
#[derive(Clone)]
pub struct ConversationFactory {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
}

impl ConversationFactory {
    /// Create the factory over its stores
    pub fn new(conversations: Arc<dyn ConversationStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self { conversations, messages }
    }

    /// Return the conversation for `request_id`, creating it on first call.
    ///
    /// Side effects on creation, each independently idempotent:
    /// the conversation id is appended to both participants' conversation
    /// lists, and a single read system message opens the thread. A failure
    /// linking one participant does not block the other's link; the error is
    /// still surfaced so the caller can retry the whole operation.
    pub async fn get_or_create(
        &self,
        request_id: &str,
        participant_ids: [String; 2],
    ) -> Result<Conversation> {
        let conversation = self
            .conversations
            .create_if_absent(request_id, participant_ids)
            .await?;
        tracing::debug!(
            conversation_id = %conversation.id,
            request_id = %request_id,
            "conversation resolved"
        );

        let mut link_failure: Option<StoreError> = None;
        for participant_id in &conversation.participant_ids {
            if let Err(err) = self
                .conversations
                .append_participant_conversation(participant_id, &conversation.id)
                .await
            {
                tracing::warn!(
                    participant = %participant_id,
                    conversation_id = %conversation.id,
                    error = %err,
                    "failed to link conversation to participant"
                );
                link_failure.get_or_insert(err);
            }
        }

        // Retried calls find the system message already present.
        let existing = self.messages.list(&conversation.id, 1).await?;
        if existing.is_empty() {
            let system = self
                .messages
                .append(&conversation.id, SYSTEM_SENDER, CONVERSATION_STARTED)
                .await?;
            self.messages.set_read(&system.id).await?;
        }

        if let Some(err) = link_failure {
            return Err(err.into());
        }
        Ok(conversation)
    }
}
