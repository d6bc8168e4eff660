//! Chat-request lifecycle
//!
//! The state machine governing meetup chat requests. A request is created
//! `Pending` and resolved exactly once: `pending -> approved` and
//! `pending -> declined` are the only edges, enforced by the store's
//! compare-and-set status update so concurrent responses have a single
//! winner. Approval synchronously produces the conversation through the
//! idempotent [`ConversationFactory`], so callers never observe an approved
//! request without a conversation (or a typed failure telling them to retry).

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use storage::records::{ChatRequest, Conversation, NewChatRequest, PushNotification, RequestStatus};
use storage::stores::{NotificationDispatcher, RequestStore, StoreError};

use crate::conversations::{ConversationError, ConversationFactory};

/// Errors surfaced by request lifecycle operations
#[derive(Debug, Error)]
pub enum RequestError {
    /// Input rejected before reaching the store
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An outgoing pending request to this receiver already exists
    #[error("a pending request to {0} already exists")]
    DuplicatePending(String),

    /// No request with the given id
    #[error("request not found: {0}")]
    NotFound(String),

    /// The request was already approved or declined by an earlier response
    #[error("request {0} was already resolved")]
    AlreadyResolved(String),

    /// Conversation creation failed after approval; the request stays
    /// approved and the operation is safe to retry
    #[error("conversation creation failed: {0}")]
    Conversation(#[from] ConversationError),

    /// Store failure (transient failures are safe to retry)
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RequestError {
    fn from(err: StoreError) -> Self {
        RequestError::Store(err)
    }
}

/// Result type for request lifecycle operations
pub type Result<T> = std::result::Result<T, RequestError>;

/// A terminal response to a pending request.
///
/// Restricted to the two terminal statuses so "respond with pending" is
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Accept the request and open a conversation
    Approve,
    /// Decline the request
    Decline,
}

impl Decision {
    /// The terminal status this decision resolves to
    pub fn status(&self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Decline => RequestStatus::Declined,
        }
    }
}

/// Outcome of a successful [`RequestLifecycle::respond`]
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// The request with its terminal status applied
    pub request: ChatRequest,
    /// The conversation, present when the decision was `Approve`
    pub conversation: Option<Conversation>,
}

/// Service governing chat-request creation and resolution
pub struct RequestLifecycle {
    requests: Arc<dyn RequestStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    factory: ConversationFactory,
}

impl RequestLifecycle {
    /// Create the lifecycle service over its collaborators
    pub fn new(
        requests: Arc<dyn RequestStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        factory: ConversationFactory,
    ) -> Self {
        Self { requests, notifier, factory }
    }

    /// Create a pending request from `sender_id` to `receiver_id`.
    ///
    /// Validation failures never reach the store. The receiver is notified
    /// best-effort: a dispatcher failure is logged and swallowed, it does
    /// not roll back the created request.
    pub async fn create(
        &self,
        sender_id: &str,
        receiver_id: &str,
        message: &str,
    ) -> Result<ChatRequest> {
        if sender_id == receiver_id {
            return Err(RequestError::InvalidRequest(
                "sender and receiver must be different participants".to_string(),
            ));
        }
        if message.trim().is_empty() {
            return Err(RequestError::InvalidRequest("message must not be empty".to_string()));
        }

        let outstanding = self.requests.list_by_participant(sender_id).await?;
        if crate::inbox::has_outstanding_request(&outstanding, sender_id, receiver_id) {
            return Err(RequestError::DuplicatePending(receiver_id.to_string()));
        }

        let request = self
            .requests
            .create(NewChatRequest {
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                message: message.to_string(),
            })
            .await?;
        tracing::info!(request_id = %request.id, sender = %sender_id, receiver = %receiver_id, "chat request created");

        let notification = PushNotification::new(
            vec![receiver_id.to_string()],
            "New meetup request",
            message,
        )
        .with_metadata(json!({ "requestId": request.id }));
        if let Err(err) = self.notifier.notify(notification).await {
            tracing::warn!(request_id = %request.id, error = %err, "request notification failed");
        }

        Ok(request)
    }

    /// Resolve a pending request.
    ///
    /// The terminal status is written with compare-and-set semantics: only
    /// the first response lands, later ones observe
    /// [`RequestError::AlreadyResolved`]. On approval the conversation is
    /// created synchronously before returning.
    pub async fn respond(&self, request_id: &str, decision: Decision) -> Result<RequestOutcome> {
        let current = self
            .requests
            .get(request_id)
            .await?
            .ok_or_else(|| RequestError::NotFound(request_id.to_string()))?;
        if current.status.is_terminal() {
            return Err(RequestError::AlreadyResolved(request_id.to_string()));
        }

        let updated = match self
            .requests
            .update_status(request_id, RequestStatus::Pending, decision.status())
            .await
        {
            Ok(request) => request,
            // Lost the race between our read and our write.
            Err(StoreError::Conflict(_)) => {
                return Err(RequestError::AlreadyResolved(request_id.to_string()))
            }
            Err(StoreError::NotFound(_)) => {
                return Err(RequestError::NotFound(request_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(request_id = %request_id, status = ?updated.status, "chat request resolved");

        let conversation = match decision {
            Decision::Approve => {
                let conversation = self
                    .factory
                    .get_or_create(
                        &updated.id,
                        [updated.sender_id.clone(), updated.receiver_id.clone()],
                    )
                    .await?;

                let notification = PushNotification::new(
                    vec![updated.sender_id.clone()],
                    "Meetup request approved",
                    format!("{} accepted your request", updated.receiver_id),
                )
                .with_metadata(json!({
                    "requestId": updated.id,
                    "conversationId": conversation.id,
                }));
                if let Err(err) = self.notifier.notify(notification).await {
                    tracing::warn!(request_id = %request_id, error = %err, "approval notification failed");
                }

                Some(conversation)
            }
            Decision::Decline => None,
        };

        Ok(RequestOutcome { request: updated, conversation })
    }
}
