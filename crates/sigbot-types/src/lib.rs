//! Shared domain types for sigbot.
//!
//! This crate contains the data shapes passed between the runtime core, the
//! infrastructure adapters and the CLI: queued and parsed messages, dead
//! letters, circuit breaker status, configuration and error enums.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod breaker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod message;
pub mod metrics;
