//! Lock-guarded FIFO request queue shared by a high-rate producer and a single
//! draining consumer.
//!
//! The crate is layered the same way the queue is driven:
//! * [`record`] – the record catalog (type tag → exact wire size) and the owned
//!   [`Record`] value producers hand to the queue.
//! * [`FifoStore`] – ordered record storage behind a short-hold lock.
//! * [`LifecycleGuard`] – remove-lock style gate that lets a disconnect wait for
//!   in-flight operations and then refuses new ones.
//! * [`Semaphore`] / [`ChannelTable`] – the consumer's counting signal object and
//!   the handle table used to resolve it on connect.
//! * [`RequestQueue`] – the connection manager composing all of the above.

mod channel;
mod error;
mod guard;
pub mod module;
mod queue;
pub mod record;
mod stats;
mod store;
mod wait;

pub use channel::{ChannelHandle, ChannelRef, ChannelTable, Semaphore, Signal};
pub use error::{QueueError, QueueResult};
pub use guard::{GuardToken, LifecycleGuard, Rejected, SessionHold};
pub use queue::{InsertOutcome, QueueConfig, RequestQueue};
pub use record::{Record, RecordHeader, RecordKind, RecordView, RECORD_HEADER_LEN};
pub use stats::QueueStatsSnapshot;
pub use store::{FifoStore, PopFront};
