//! Gateway transports.

pub mod websocket;

pub use websocket::{ReconnectBackoff, WebSocketTransport, build_ws_uri};
