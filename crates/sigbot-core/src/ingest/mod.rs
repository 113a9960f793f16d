//! Ingestion: from the transport into the dispatch queue.
//!
//! The listener owns the producer side of the queue. Around it sit the pause
//! coordinator (throttles intake without dropping the connection), the
//! durable replay buffer (crash recovery for accepted frames) and the
//! watermark that tells the runtime how far the replay buffer may be compacted.

pub mod checkpoint;
pub mod intake;
pub mod listener;
pub mod replay_buffer;

pub use checkpoint::IngestWatermark;
pub use intake::{IntakeController, IntakeSnapshot};
pub use listener::{EnqueueOutcome, Listener, ListenerSettings};
pub use replay_buffer::ReplayBuffer;
