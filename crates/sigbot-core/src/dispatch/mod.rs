//! Dispatch: from the queue to command handlers.
//!
//! The dispatch queue feeds the worker pool; each worker parses a frame,
//! routes it through the command router and runs the middleware chain that
//! ends in the command's handler.

pub mod context;
pub mod middleware;
pub mod pool;
pub mod queue;
pub mod router;
mod worker;

pub use context::{MessageContext, Services};
pub use middleware::{CommandHandler, HandlerDyn, Middleware, MiddlewareDyn, Next};
pub use pool::{PoolParts, PoolSettings, WorkerPool};
pub use queue::{BoundedQueue, DispatchQueue, shard_index};
pub use router::{Command, CommandBuilder, CommandRouter, RouteMatch, RouterError, Trigger};
pub use worker::Disposition;
