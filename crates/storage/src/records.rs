//! Record types shared between the messaging core and its stores
//!
//! These are the durable shapes of the system: chat requests, conversations,
//! and messages. Stores assign identifiers and timestamps; the core treats
//! both as opaque apart from their ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved sender id for system-generated messages
/// (e.g. the "Conversation started" marker).
pub const SYSTEM_SENDER: &str = "system";

/// Reserved body prefix denoting a shared-location payload.
///
/// The payload after the prefix is opaque to the core; only the presentation
/// layer interprets it.
pub const LOCATION_BODY_PREFIX: &str = "location:";

/// Status of a chat request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestStatus {
    /// Awaiting the receiver's response
    Pending,
    /// Receiver accepted; a conversation exists (or is being created)
    Approved,
    /// Receiver declined
    Declined,
}

impl RequestStatus {
    /// Whether this status is terminal (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// A meetup chat request from one participant to another
///
/// Created `Pending`, resolved exactly once to `Approved` or `Declined`,
/// and kept as history afterwards (never deleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Store-assigned unique id
    pub id: String,
    /// Participant who sent the request
    pub sender_id: String,
    /// Participant the request is addressed to
    pub receiver_id: String,
    /// Free-text message accompanying the request
    pub message: String,
    /// Current lifecycle status
    pub status: RequestStatus,
    /// When the request was created (store-assigned)
    pub created_at: DateTime<Utc>,
}

impl ChatRequest {
    /// Whether `participant_id` is the sender or the receiver
    pub fn involves(&self, participant_id: &str) -> bool {
        self.sender_id == participant_id || self.receiver_id == participant_id
    }
}

/// Fields of a chat request before the store has assigned identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatRequest {
    /// Participant sending the request
    pub sender_id: String,
    /// Participant receiving the request
    pub receiver_id: String,
    /// Free-text message accompanying the request
    pub message: String,
}

/// A durable two-participant message thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Store-assigned unique id
    pub id: String,
    /// The two distinct participants, in canonical (sorted) order
    pub participant_ids: [String; 2],
    /// The approved request this conversation was created from
    pub created_from_request_id: String,
    /// When the conversation was created (store-assigned)
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The other participant's id, if `participant_id` is a member
    pub fn other_participant(&self, participant_id: &str) -> Option<&str> {
        let [a, b] = &self.participant_ids;
        if a == participant_id {
            Some(b)
        } else if b == participant_id {
            Some(a)
        } else {
            None
        }
    }
}

/// A message within a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned, creation-ordered unique id
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Sending participant, or [`SYSTEM_SENDER`]
    pub sender_id: String,
    /// Plain-text body (see [`LOCATION_BODY_PREFIX`])
    pub body: String,
    /// Store-assigned creation timestamp; the store guarantees monotonicity,
    /// client clocks are not trusted for ordering
    pub created_at: DateTime<Utc>,
    /// Whether the counterpart participant has seen this message
    /// (monotonic: once true, never reverts)
    pub is_read: bool,
}

impl Message {
    /// Whether this message was generated by the system rather than a participant
    pub fn is_system(&self) -> bool {
        self.sender_id == SYSTEM_SENDER
    }

    /// Whether the body carries a shared-location payload
    pub fn is_location_share(&self) -> bool {
        self.body.starts_with(LOCATION_BODY_PREFIX)
    }

    /// Sort key for the total order within a conversation
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Canonical ordering of a participant pair.
///
/// Conversations treat the pair as unordered; storing it sorted makes the
/// pair comparable regardless of who initiated.
pub fn canonical_pair(a: impl Into<String>, b: impl Into<String>) -> [String; 2] {
    let (a, b) = (a.into(), b.into());
    if a <= b {
        [a, b]
    } else {
        [b, a]
    }
}

/// A best-effort push notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    /// Participants to notify
    pub target_ids: Vec<String>,
    /// Short title line
    pub title: String,
    /// Body text
    pub body: String,
    /// Opaque metadata forwarded to the client (deep-link ids and the like)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl PushNotification {
    /// Create a notification with no metadata
    pub fn new(
        target_ids: Vec<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            target_ids,
            title: title.into(),
            body: body.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
