//! Infrastructure layer for sigbot.
//!
//! Contains implementations of the ports defined in `sigbot-core`: SQLite and
//! in-memory storage, the gateway WebSocket transport, and the configuration
//! loader (TOML file plus environment overrides).

pub mod config;
pub mod sqlite;
pub mod storage;
pub mod transport;
