//! In-memory realtime message feed
//!
//! A per-conversation broadcast hub. Each subscription gets its own
//! forwarding task that drains the broadcast channel into the subscriber's
//! queue until the subscriber closes or the channel is dropped, so a closed
//! [`Subscription`] never receives further deliveries.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::records::Message;
use crate::stores::{MessageFeed, Result, Subscription};

/// Broadcast capacity per conversation channel
const CHANNEL_CAPACITY: usize = 64;

/// Queue depth per subscriber
const SUBSCRIBER_BUFFER: usize = 64;

/// In-memory [`MessageFeed`] hub.
///
/// [`MemoryMessageStore::with_feed`](crate::memory::MemoryMessageStore::with_feed)
/// publishes every append here, so subscribers observe new messages live,
/// including echoes of their own sends.
#[derive(Debug, Default)]
pub struct RealtimeHub {
    channels: RwLock<HashMap<String, broadcast::Sender<Message>>>,
}

impl RealtimeHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to the conversation's subscribers
    pub fn publish(&self, message: &Message) {
        let sender = self.sender_for(&message.conversation_id);
        // No receivers is fine; the feed is best-effort by nature.
        let _ = sender.send(message.clone());
    }

    /// Drop a conversation's channel, severing all of its live
    /// subscriptions (test hook for simulating feed loss)
    pub fn sever(&self, conversation_id: &str) {
        self.channels.write().unwrap().remove(conversation_id);
    }

    fn sender_for(&self, conversation_id: &str) -> broadcast::Sender<Message> {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageFeed for RealtimeHub {
    async fn subscribe(&self, conversation_id: &str) -> Result<Subscription> {
        let mut source = self.sender_for(conversation_id).subscribe();
        let (events_tx, events_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = source.recv() => match event {
                        Ok(message) => {
                            if events_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        // Lagged means messages were missed; end the stream
                        // so the consumer reconciles with a re-fetch.
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "feed subscriber lagged, dropping stream");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut cancel_rx => break,
                }
            }
        });

        Ok(Subscription::new(events_rx, cancel_tx))
    }
}
