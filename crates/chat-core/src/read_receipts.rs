//! Read-receipt tracking
//!
//! Marks a conversation read from the perspective of one participant:
//! every message from the other side that is still unread gets its flag
//! persisted and flipped locally. Only messages already present in the
//! handle's sequence at call time are touched, so marking never races ahead
//! of delivery; callers re-invoke after the next delivery if they want
//! later messages covered. The whole operation is idempotent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use storage::records::Message;
use storage::stores::{MessageStore, StoreError};

use crate::sync::ConversationHandle;

/// Errors surfaced by read-receipt operations
#[derive(Debug, Error)]
pub enum ReadError {
    /// Store failure; the operation is idempotent and safe to retry
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for read-receipt operations
pub type Result<T> = std::result::Result<T, ReadError>;

/// Persists and tracks per-reader read state
pub struct ReadReceiptTracker {
    messages: Arc<dyn MessageStore>,
}

impl ReadReceiptTracker {
    /// Create a tracker over the message store
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }

    /// Mark every locally-present unread message from other senders as
    /// read, persisting each flag before flipping it locally.
    ///
    /// Returns the number of messages marked. Calling again immediately is
    /// a no-op; calling concurrently with new deliveries marks only what
    /// was present when the snapshot was taken.
    pub async fn mark_read(&self, handle: &ConversationHandle, reader_id: &str) -> Result<usize> {
        let snapshot = handle.messages();
        let mut marked = Vec::new();
        for message in snapshot
            .iter()
            .filter(|m| !m.is_read && m.sender_id != reader_id)
        {
            match self.messages.set_read(&message.id).await {
                Ok(()) => marked.push(message.id.clone()),
                // The message may have been pruned server-side between the
                // snapshot and the write; skip it rather than failing the
                // rest of the batch.
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(message_id = %message.id, "skipping read mark for missing message");
                }
                Err(err) => {
                    // Persist what we managed locally, then surface the failure.
                    handle.mark_local_read(&marked).await;
                    return Err(err.into());
                }
            }
        }
        let count = marked.len();
        handle.mark_local_read(&marked).await;
        if count > 0 {
            tracing::debug!(
                conversation_id = %handle.conversation_id(),
                reader = %reader_id,
                count,
                "messages marked read"
            );
        }
        Ok(count)
    }

    /// The read high-water mark for a reader: the latest `created_at` among
    /// messages from other senders that the reader has seen
    pub fn read_high_water(messages: &[Message], reader_id: &str) -> Option<DateTime<Utc>> {
        messages
            .iter()
            .filter(|m| m.is_read && m.sender_id != reader_id)
            .map(|m| m.created_at)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::memory::MemoryMessageStore;
    use storage::realtime::RealtimeHub;
    use storage::stores::MessageFeed;

    use crate::sync::MessageSyncEngine;

    async fn fixture() -> (MessageSyncEngine, Arc<MemoryMessageStore>, ReadReceiptTracker) {
        let hub = Arc::new(RealtimeHub::new());
        let store = Arc::new(MemoryMessageStore::with_feed(hub.clone()));
        let engine = MessageSyncEngine::new(
            store.clone() as Arc<dyn MessageStore>,
            hub as Arc<dyn MessageFeed>,
        );
        let tracker = ReadReceiptTracker::new(store.clone() as Arc<dyn MessageStore>);
        (engine, store, tracker)
    }

    #[tokio::test]
    async fn test_marks_only_messages_from_others() {
        let (engine, store, tracker) = fixture().await;
        store.append("c1", "u1", "mine").await.unwrap();
        store.append("c1", "u2", "theirs").await.unwrap();

        let handle = engine.open("c1").await.unwrap();
        let marked = tracker.mark_read(&handle, "u1").await.unwrap();
        assert_eq!(marked, 1);

        let stored = store.list("c1", 10).await.unwrap();
        assert!(!stored[0].is_read, "own message left untouched");
        assert!(stored[1].is_read);

        let local = handle.messages();
        assert!(!local[0].is_read);
        assert!(local[1].is_read);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let (engine, store, tracker) = fixture().await;
        store.append("c1", "u2", "one").await.unwrap();
        store.append("c1", "u2", "two").await.unwrap();

        let handle = engine.open("c1").await.unwrap();
        assert_eq!(tracker.mark_read(&handle, "u1").await.unwrap(), 2);
        assert_eq!(tracker.mark_read(&handle, "u1").await.unwrap(), 0);

        let stored = store.list("c1", 10).await.unwrap();
        assert!(stored.iter().all(|m| m.is_read));
    }

    #[tokio::test]
    async fn test_marks_only_locally_present_messages() {
        let (engine, store, tracker) = fixture().await;
        store.append("c1", "u2", "present").await.unwrap();
        let handle = engine.open("c1").await.unwrap();
        handle.close();

        // Appended after the handle stopped receiving; not in the snapshot.
        store.append("c1", "u2", "not yet delivered").await.unwrap();

        assert_eq!(tracker.mark_read(&handle, "u1").await.unwrap(), 1);
        let stored = store.list("c1", 10).await.unwrap();
        assert!(stored[0].is_read);
        assert!(!stored[1].is_read);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let (engine, store, tracker) = fixture().await;
        store.append("c1", "u2", "one").await.unwrap();
        store.append("c1", "u2", "two").await.unwrap();
        let handle = engine.open("c1").await.unwrap();

        store.fail_next_operation();
        let err = tracker.mark_read(&handle, "u1").await.unwrap_err();
        assert!(matches!(err, ReadError::Store(StoreError::Unavailable(_))));

        // The retry covers whatever the first call missed.
        let marked = tracker.mark_read(&handle, "u1").await.unwrap();
        assert_eq!(marked, 2);
    }

    #[tokio::test]
    async fn test_read_high_water() {
        let (engine, store, tracker) = fixture().await;
        store.append("c1", "u2", "one").await.unwrap();
        store.append("c1", "u2", "two").await.unwrap();
        let handle = engine.open("c1").await.unwrap();

        assert!(ReadReceiptTracker::read_high_water(&handle.messages(), "u1").is_none());

        tracker.mark_read(&handle, "u1").await.unwrap();
        let messages = handle.messages();
        let high_water = ReadReceiptTracker::read_high_water(&messages, "u1").unwrap();
        assert_eq!(high_water, messages[1].created_at);
    }
}
