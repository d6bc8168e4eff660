//! Storage layer for Meetpoint
//!
//! This crate provides the record types and collaborator interfaces the
//! messaging core is built against, plus in-memory reference implementations
//! for tests and embedders without a durable backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod push;
pub mod realtime;
pub mod records;
pub mod stores;

pub use memory::{MemoryConversationStore, MemoryMessageStore, MemoryRequestStore};
pub use push::LoggingDispatcher;
pub use realtime::RealtimeHub;
pub use records::{
    ChatRequest, Conversation, Message, NewChatRequest, PushNotification, RequestStatus,
    LOCATION_BODY_PREFIX, SYSTEM_SENDER,
};
pub use stores::{
    ConversationStore, MessageFeed, MessageStore, NotificationDispatcher, RequestStore,
    StoreError, Subscription,
};
