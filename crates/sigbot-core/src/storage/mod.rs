//! Durable storage port used by the dead-letter queue and the replay buffer.

pub mod box_store;
pub mod store;

pub use box_store::BoxStorage;
pub use store::Storage;
