//! In-memory reference implementations of the collaborator stores
//!
//! These back the test suite and embedders that have no durable backend.
//! They uphold the contracts the core depends on: compare-and-set status
//! updates, create-if-absent conversation creation, monotonic message
//! timestamps, and creation-ordered message ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::realtime::RealtimeHub;
use crate::records::{
    canonical_pair, ChatRequest, Conversation, Message, NewChatRequest, RequestStatus,
};
use crate::stores::{
    ConversationStore, MessageStore, RequestStore, Result, StoreError,
};

/// One-shot fault toggle shared by the memory stores.
///
/// Arming it makes the next operation fail with [`StoreError::Unavailable`],
/// which is how tests exercise the transient-failure paths.
#[derive(Debug, Default)]
struct FaultToggle {
    armed: AtomicBool,
}

impl FaultToggle {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn check(&self, store: &str) -> Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{store}: injected fault")))
        } else {
            Ok(())
        }
    }
}

/// Timestamp source that never repeats or goes backwards.
///
/// Wall-clock reads within the same millisecond are bumped forward so the
/// `(created_at, id)` order the core sorts by is strict.
#[derive(Debug)]
struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl MonotonicClock {
    fn new() -> Self {
        Self { last: Mutex::new(Utc::now() - Duration::milliseconds(1)) }
    }

    fn next(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap();
        let mut now = Utc::now();
        if now <= *last {
            now = *last + Duration::milliseconds(1);
        }
        *last = now;
        now
    }
}

/// In-memory [`RequestStore`]
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    requests: RwLock<HashMap<String, ChatRequest>>,
    seq: AtomicU64,
    fault: FaultToggle,
}

impl MemoryRequestStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail with `Unavailable`
    pub fn fail_next_operation(&self) {
        self.fault.arm();
    }

    fn next_id(&self) -> String {
        format!("req-{:06}", self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, request: NewChatRequest) -> Result<ChatRequest> {
        self.fault.check("request store")?;
        let record = ChatRequest {
            id: self.next_id(),
            sender_id: request.sender_id,
            receiver_id: request.receiver_id,
            message: request.message,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
        };
        self.requests
            .write()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<ChatRequest>> {
        self.fault.check("request store")?;
        Ok(self.requests.read().unwrap().get(id).cloned())
    }

    async fn list_by_participant(&self, participant_id: &str) -> Result<Vec<ChatRequest>> {
        self.fault.check("request store")?;
        let mut requests: Vec<ChatRequest> = self
            .requests
            .read()
            .unwrap()
            .values()
            .filter(|r| r.involves(participant_id))
            .cloned()
            .collect();
        requests.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(requests)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: RequestStatus,
        new: RequestStatus,
    ) -> Result<ChatRequest> {
        self.fault.check("request store")?;
        let mut requests = self.requests.write().unwrap();
        let record = requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status != expected {
            return Err(StoreError::Conflict(id.to_string()));
        }
        record.status = new;
        Ok(record.clone())
    }
}

/// In-memory [`ConversationStore`]
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    by_request: RwLock<HashMap<String, Conversation>>,
    participant_lists: RwLock<HashMap<String, Vec<String>>>,
    seq: AtomicU64,
    fault: FaultToggle,
}

impl MemoryConversationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail with `Unavailable`
    pub fn fail_next_operation(&self) {
        self.fault.arm();
    }

    /// Number of stored conversations (test observability)
    pub fn len(&self) -> usize {
        self.by_request.read().unwrap().len()
    }

    /// Whether no conversations are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_if_absent(
        &self,
        request_id: &str,
        participant_ids: [String; 2],
    ) -> Result<Conversation> {
        self.fault.check("conversation store")?;
        let mut by_request = self.by_request.write().unwrap();
        if let Some(existing) = by_request.get(request_id) {
            return Ok(existing.clone());
        }
        let [a, b] = participant_ids;
        let conversation = Conversation {
            id: format!("conv-{:06}", self.seq.fetch_add(1, Ordering::SeqCst) + 1),
            participant_ids: canonical_pair(a, b),
            created_from_request_id: request_id.to_string(),
            created_at: Utc::now(),
        };
        by_request.insert(request_id.to_string(), conversation.clone());
        Ok(conversation)
    }

    async fn append_participant_conversation(
        &self,
        participant_id: &str,
        conversation_id: &str,
    ) -> Result<()> {
        self.fault.check("conversation store")?;
        let mut lists = self.participant_lists.write().unwrap();
        let list = lists.entry(participant_id.to_string()).or_default();
        if !list.iter().any(|id| id == conversation_id) {
            list.push(conversation_id.to_string());
        }
        Ok(())
    }

    async fn conversations_for(&self, participant_id: &str) -> Result<Vec<String>> {
        self.fault.check("conversation store")?;
        Ok(self
            .participant_lists
            .read()
            .unwrap()
            .get(participant_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory [`MessageStore`], optionally publishing appends to a
/// [`RealtimeHub`] so subscribers observe them live
#[derive(Debug)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<Message>>,
    clock: MonotonicClock,
    seq: AtomicU64,
    fault: FaultToggle,
    feed: Option<Arc<RealtimeHub>>,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    /// Create a store without a live feed
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            clock: MonotonicClock::new(),
            seq: AtomicU64::new(0),
            fault: FaultToggle::default(),
            feed: None,
        }
    }

    /// Create a store that publishes every append to `feed`
    pub fn with_feed(feed: Arc<RealtimeHub>) -> Self {
        Self { feed: Some(feed), ..Self::new() }
    }

    /// Make the next operation fail with `Unavailable`
    pub fn fail_next_operation(&self) {
        self.fault.arm();
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<Message> {
        self.fault.check("message store")?;
        let message = Message {
            id: format!("msg-{:08}", self.seq.fetch_add(1, Ordering::SeqCst) + 1),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            created_at: self.clock.next(),
            is_read: false,
        };
        self.messages.write().unwrap().push(message.clone());
        if let Some(feed) = &self.feed {
            feed.publish(&message);
        }
        Ok(message)
    }

    async fn list(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.fault.check("message store")?;
        let mut messages: Vec<Message> = self
            .messages
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn set_read(&self, message_id: &str) -> Result<()> {
        self.fault.check("message store")?;
        let mut messages = self.messages.write().unwrap();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        message.is_read = true;
        Ok(())
    }
}
