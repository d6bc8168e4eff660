//! Request inbox aggregation
//!
//! Pure partitioning of a request collection by viewer, plus the
//! [`RequestInbox`] aggregate that owns one viewer's collection and
//! publishes recomputed views reactively. External layers read snapshots or
//! watch for changes; they never mutate the collection directly.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use storage::records::{ChatRequest, RequestStatus};
use storage::stores::{RequestStore, StoreError};

/// Errors surfaced by inbox operations
#[derive(Debug, Error)]
pub enum InboxError {
    /// Store failure (transient failures are safe to retry)
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for inbox operations
pub type Result<T> = std::result::Result<T, InboxError>;

/// A request collection split by the viewer's role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Partitioned {
    /// Requests addressed to the viewer
    pub incoming: Vec<ChatRequest>,
    /// Requests the viewer sent
    pub outgoing: Vec<ChatRequest>,
}

/// Split `requests` by the viewer's role. Pure: no I/O, same input gives
/// the same split.
pub fn partition(requests: &[ChatRequest], viewer_id: &str) -> Partitioned {
    let mut partitioned = Partitioned::default();
    for request in requests {
        if request.receiver_id == viewer_id {
            partitioned.incoming.push(request.clone());
        } else if request.sender_id == viewer_id {
            partitioned.outgoing.push(request.clone());
        }
    }
    partitioned
}

/// Whether the viewer already has a pending outgoing request to `target_id`.
///
/// The presentation layer uses this to suppress duplicate quick-requests.
pub fn has_outstanding_request(
    requests: &[ChatRequest],
    viewer_id: &str,
    target_id: &str,
) -> bool {
    requests.iter().any(|r| {
        r.sender_id == viewer_id
            && r.receiver_id == target_id
            && r.status == RequestStatus::Pending
    })
}

/// Derived presentation view of a viewer's requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxView {
    /// Pending requests awaiting the viewer's response
    pub incoming_pending: Vec<ChatRequest>,
    /// Pending requests the viewer sent
    pub outgoing_pending: Vec<ChatRequest>,
    /// Resolved requests involving the viewer, kept as history
    pub responded: Vec<ChatRequest>,
}

impl InboxView {
    /// Project the view from a request collection
    fn project(requests: &[ChatRequest], viewer_id: &str) -> Self {
        let mut view = InboxView::default();
        for request in requests.iter().filter(|r| r.involves(viewer_id)) {
            match (request.status, request.receiver_id == viewer_id) {
                (RequestStatus::Pending, true) => view.incoming_pending.push(request.clone()),
                (RequestStatus::Pending, false) => view.outgoing_pending.push(request.clone()),
                _ => view.responded.push(request.clone()),
            }
        }
        view
    }
}

/// One viewer's owned request collection with reactive views.
///
/// Mutation happens only through [`refresh`](RequestInbox::refresh) and
/// [`upsert`](RequestInbox::upsert); every change republishes the projected
/// [`InboxView`] through a watch channel.
pub struct RequestInbox {
    viewer_id: String,
    requests: Arc<dyn RequestStore>,
    collection: RwLock<Vec<ChatRequest>>,
    view: watch::Sender<InboxView>,
}

impl RequestInbox {
    /// Create an empty inbox for `viewer_id`
    pub fn new(viewer_id: impl Into<String>, requests: Arc<dyn RequestStore>) -> Self {
        let (view, _) = watch::channel(InboxView::default());
        Self {
            viewer_id: viewer_id.into(),
            requests,
            collection: RwLock::new(Vec::new()),
            view,
        }
    }

    /// The viewer this inbox aggregates for
    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Reload the collection from the store and republish the view
    pub async fn refresh(&self) -> Result<InboxView> {
        let fetched = self.requests.list_by_participant(&self.viewer_id).await?;
        let mut collection = self.collection.write().await;
        *collection = fetched;
        Ok(self.publish(&collection))
    }

    /// Apply a locally observed request (just created, or just resolved)
    /// without a store round-trip, and republish the view
    pub async fn upsert(&self, request: ChatRequest) -> InboxView {
        let mut collection = self.collection.write().await;
        match collection.iter_mut().find(|r| r.id == request.id) {
            Some(existing) => *existing = request,
            None => collection.push(request),
        }
        self.publish(&collection)
    }

    /// Snapshot of the current view
    pub fn view(&self) -> InboxView {
        self.view.borrow().clone()
    }

    /// Watch the view; receivers observe every recomputation
    pub fn subscribe(&self) -> watch::Receiver<InboxView> {
        self.view.subscribe()
    }

    /// Snapshot of the raw collection
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.collection.read().await.clone()
    }

    /// Whether the viewer has a pending outgoing request to `target_id`,
    /// evaluated against the local collection
    pub async fn has_outstanding(&self, target_id: &str) -> bool {
        has_outstanding_request(&self.collection.read().await, &self.viewer_id, target_id)
    }

    fn publish(&self, collection: &[ChatRequest]) -> InboxView {
        let view = InboxView::project(collection, &self.viewer_id);
        self.view.send_replace(view.clone());
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storage::memory::MemoryRequestStore;
    use storage::records::NewChatRequest;

    fn request(id: &str, sender: &str, receiver: &str, status: RequestStatus) -> ChatRequest {
        ChatRequest {
            id: id.to_string(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            message: "Hi".to_string(),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_partition_splits_by_role() {
        let requests = vec![
            request("r1", "u1", "u2", RequestStatus::Pending),
            request("r2", "u3", "u1", RequestStatus::Pending),
            request("r3", "u2", "u3", RequestStatus::Pending),
        ];

        let partitioned = partition(&requests, "u1");
        assert_eq!(partitioned.outgoing.len(), 1);
        assert_eq!(partitioned.outgoing[0].id, "r1");
        assert_eq!(partitioned.incoming.len(), 1);
        assert_eq!(partitioned.incoming[0].id, "r2");
    }

    #[test]
    fn test_partition_is_pure() {
        let requests = vec![
            request("r1", "u1", "u2", RequestStatus::Pending),
            request("r2", "u3", "u1", RequestStatus::Approved),
        ];
        assert_eq!(partition(&requests, "u1"), partition(&requests, "u1"));
    }

    #[test]
    fn test_has_outstanding_request() {
        let requests = vec![
            request("r1", "u1", "u2", RequestStatus::Pending),
            request("r2", "u1", "u3", RequestStatus::Declined),
        ];
        assert!(has_outstanding_request(&requests, "u1", "u2"));
        // Resolved requests do not count
        assert!(!has_outstanding_request(&requests, "u1", "u3"));
        // Direction matters
        assert!(!has_outstanding_request(&requests, "u2", "u1"));
    }

    #[test]
    fn test_view_projects_three_partitions() {
        let requests = vec![
            request("r1", "u2", "u1", RequestStatus::Pending),
            request("r2", "u1", "u3", RequestStatus::Pending),
            request("r3", "u1", "u4", RequestStatus::Approved),
            request("r4", "u5", "u1", RequestStatus::Declined),
            request("r5", "u6", "u7", RequestStatus::Pending),
        ];

        let view = InboxView::project(&requests, "u1");
        assert_eq!(view.incoming_pending.len(), 1);
        assert_eq!(view.incoming_pending[0].id, "r1");
        assert_eq!(view.outgoing_pending.len(), 1);
        assert_eq!(view.outgoing_pending[0].id, "r2");
        let responded: Vec<&str> = view.responded.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(responded, vec!["r3", "r4"]);
    }

    #[tokio::test]
    async fn test_refresh_loads_from_store() {
        let store = Arc::new(MemoryRequestStore::new());
        store
            .create(NewChatRequest {
                sender_id: "u2".into(),
                receiver_id: "u1".into(),
                message: "Hi".into(),
            })
            .await
            .unwrap();

        let inbox = RequestInbox::new("u1", store.clone() as Arc<dyn RequestStore>);
        assert_eq!(inbox.view(), InboxView::default());

        let view = inbox.refresh().await.unwrap();
        assert_eq!(view.incoming_pending.len(), 1);
        assert_eq!(inbox.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_recomputes_and_notifies() {
        let store = Arc::new(MemoryRequestStore::new());
        let inbox = RequestInbox::new("u1", store as Arc<dyn RequestStore>);
        let mut rx = inbox.subscribe();

        inbox.upsert(request("r1", "u1", "u2", RequestStatus::Pending)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().outgoing_pending.len(), 1);
        assert!(inbox.has_outstanding("u2").await);

        // The same request resolving moves it between partitions
        inbox.upsert(request("r1", "u1", "u2", RequestStatus::Approved)).await;
        rx.changed().await.unwrap();
        let view = rx.borrow().clone();
        assert!(view.outgoing_pending.is_empty());
        assert_eq!(view.responded.len(), 1);
        assert!(!inbox.has_outstanding("u2").await);
    }
}
