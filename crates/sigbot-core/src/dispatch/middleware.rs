//! Command handlers and the middleware chain.
//!
//! Both traits use RPITIT and come with an object-safe `*Dyn` twin plus a
//! blanket impl, so workers can hold them as `Arc<dyn ...>`. Plain async
//! closures implement both traits.
//!
//! Middleware `i` receives a [`Next`] bound to middleware `i + 1`; the last
//! `Next` runs the command handler. A middleware short-circuits by returning
//! without calling `next.run(ctx)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sigbot_types::error::HandlerError;

use super::context::MessageContext;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles messages routed to a command.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, ctx: MessageContext) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<F, Fut> CommandHandler for F
where
    F: Fn(MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn handle(&self, ctx: MessageContext) -> impl Future<Output = Result<(), HandlerError>> + Send {
        self(ctx)
    }
}

/// Object-safe version of [`CommandHandler`].
pub trait HandlerDyn: Send + Sync {
    fn handle_boxed(&self, ctx: MessageContext) -> BoxFuture<'_, Result<(), HandlerError>>;
}

impl<T: CommandHandler> HandlerDyn for T {
    fn handle_boxed(&self, ctx: MessageContext) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(self.handle(ctx))
    }
}

/// Wraps command dispatch: logging, auth, timing, short-circuiting.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: MessageContext, next: Next) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<F, Fut> Middleware for F
where
    F: Fn(MessageContext, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn handle(&self, ctx: MessageContext, next: Next) -> impl Future<Output = Result<(), HandlerError>> + Send {
        self(ctx, next)
    }
}

/// Object-safe version of [`Middleware`].
pub trait MiddlewareDyn: Send + Sync {
    fn handle_boxed(&self, ctx: MessageContext, next: Next) -> BoxFuture<'_, Result<(), HandlerError>>;
}

impl<T: Middleware> MiddlewareDyn for T {
    fn handle_boxed(&self, ctx: MessageContext, next: Next) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(self.handle(ctx, next))
    }
}

/// Continuation for the rest of the chain.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn MiddlewareDyn>]>,
    index: usize,
    handler: Arc<dyn HandlerDyn>,
}

impl Next {
    /// Start of a chain ending in `handler`.
    pub fn new(chain: Arc<[Arc<dyn MiddlewareDyn>]>, handler: Arc<dyn HandlerDyn>) -> Self {
        Self {
            chain,
            index: 0,
            handler,
        }
    }

    /// Middleware still to run before the handler.
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }

    /// Run the rest of the chain.
    pub async fn run(self, ctx: MessageContext) -> Result<(), HandlerError> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    handler: self.handler,
                };
                middleware.handle_boxed(ctx, next).await
            }
            None => self.handler.handle_boxed(ctx).await,
        }
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}
