//! Transport port: the source of raw frames from the messaging gateway.
//!
//! The stream is boxed (not RPITIT) so the runtime can hold any transport as
//! `Arc<dyn Transport>`. Reconnection is the transport's own business; an
//! `Err` item means the transport has given up and the listener must stop.

use std::pin::Pin;

use futures_util::Stream;
use sigbot_types::error::TransportError;

/// Stream of raw text frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send + 'static>>;

/// Trait for gateway transports (WebSocket in production, scripted in tests).
pub trait Transport: Send + Sync {
    /// Start receiving. The stream ends after `close()` is called.
    fn listen(&self) -> FrameStream;

    /// Stop receiving and release the connection. Idempotent.
    fn close(&self);
}
