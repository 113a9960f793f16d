//! Ingestion and dispatch runtime for sigbot.
//!
//! This crate defines the "ports" (storage, transport and parser traits) that
//! the infrastructure layer implements, and everything that runs between
//! them: the bounded dispatch queue, the worker pool with its router and
//! middleware chain, the circuit breaker, the rate limiter and the
//! dead-letter queue. It depends only on `sigbot-types`, never on
//! `sigbot-infra` or any database/IO crate.

pub mod dispatch;
pub mod dlq;
pub mod ingest;
pub mod lock_manager;
pub mod metrics;
pub mod parser;
pub mod resilience;
pub mod runtime;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use runtime::{BotRuntime, RequeueSummary, RuntimeError};
