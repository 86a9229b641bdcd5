//! Method-name routing of inbound stratum events

use super::context::ConnectionContext;
use super::event::JsonRpcEvent;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

/// Handler for one stratum method
///
/// Handlers receive the connection's context exclusively for the duration of
/// the call and communicate with the miner only through
/// [`ConnectionContext::reply`] and [`ConnectionContext::push`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle `event` on behalf of the connection owning `ctx`
    async fn handle(&self, ctx: &mut ConnectionContext, event: JsonRpcEvent) -> Result<()>;
}

/// Mutable handler table, filled in before the listener starts
pub type HandlerMap = HashMap<String, Arc<dyn EventHandler>>;

/// Frozen handler table shared by every connection
#[derive(Clone)]
pub struct MethodDispatcher {
    handlers: Arc<HandlerMap>,
}

impl MethodDispatcher {
    /// Freeze `handlers`; no registration is possible afterwards
    pub fn new(handlers: HandlerMap) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Whether a handler is registered for `method`
    pub fn handles(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Route `event` to its handler
    ///
    /// Handler failures are logged in the connection's span and returned to
    /// the caller. They never affect other connections.
    pub async fn dispatch(&self, ctx: &mut ConnectionContext, event: JsonRpcEvent) -> Result<()> {
        let span = ctx.span().clone();
        let method = event.method.clone();

        let Some(handler) = self.handlers.get(&method) else {
            let err = Error::unknown_method(&method);
            span.in_scope(|| debug!("{}", err));
            return Err(err);
        };

        let result = handler.handle(ctx, event).instrument(span.clone()).await;
        if let Err(e) = &result {
            span.in_scope(|| warn!(method = %method, category = e.category(), "error handling event: {}", e));
        }
        result
    }
}

impl std::fmt::Debug for MethodDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("MethodDispatcher").field("methods", &methods).finish()
    }
}
