//! Meetup-request lifecycle and realtime messaging core for Meetpoint
//!
//! This crate contains the request state machine, idempotent conversation
//! creation, live message synchronization, read-receipt tracking, and the
//! request inbox aggregation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conversations;
pub mod inbox;
pub mod read_receipts;
pub mod requests;
pub mod sync;

pub use conversations::ConversationFactory;
pub use inbox::RequestInbox;
pub use read_receipts::ReadReceiptTracker;
pub use requests::{Decision, RequestLifecycle, RequestOutcome};
pub use sync::{ConversationHandle, FeedStatus, MessageSyncEngine};
