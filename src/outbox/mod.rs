//! Transactional outbox: exactly-once publish intent over an
//! at-least-once broker.
//!
//! Registration writes the outgoing message into the ledger inside the
//! caller's own transaction, making "business write" and "intent to
//! publish" atomic. Dispatch then runs in three phases (a short lock
//! transaction, the broker publish outside any transaction, and a short
//! mark transaction) so no database lock is ever held across network
//! I/O to the broker.

mod entry;
mod publisher;
mod sweeper;

pub use entry::OutboxEntry;
pub use publisher::{DispatchOutcome, OutboxPublisher};
pub use sweeper::{OutboxSweeper, SweeperHandle, SweeperStats};
