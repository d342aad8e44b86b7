//! Durable, ordered mutation pipeline
//!
//! Every change to queue items and votes is enqueued here, applied by
//! whichever node's worker claims it, and announced through the shared event
//! log that every node relays to its own connections.

pub mod action;
pub mod events;
pub mod queue;
pub mod relay;
pub mod worker;

pub use action::{Mutation, PendingAction};
pub use events::{Audience, LoggedEvent, SqliteEventLog};
pub use queue::{ActionQueue, Delivery, SqliteActionQueue};
pub use relay::EventRelay;
pub use worker::{EventSink, MutationWorker};
