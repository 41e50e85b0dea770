//! Command handlers the gateway routes interactions to.
//!
//! Real bot commands (session counting, role assignment) live with their
//! owners and register here; only `ping` ships with the gateway.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::gateway::context::current_trace_id;
use crate::gateway::dispatch::{CommandInvocation, ReplyChannel, ReplyMessage};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Name used in `POST /commands/{name}` and as the rate-limit operation.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        reply: &dyn ReplyChannel,
    ) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in commands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PingCommand));
        registry
    }

    /// Add `handler`, replacing any previous handler with the same name.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let name = handler.name().trim().to_ascii_lowercase();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(command = %name, "command handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&name.trim().to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Liveness check; replies with the caller's trace id.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingCommand;

#[async_trait]
impl CommandHandler for PingCommand {
    fn name(&self) -> &str {
        "ping"
    }

    async fn execute(
        &self,
        _invocation: &CommandInvocation,
        reply: &dyn ReplyChannel,
    ) -> Result<()> {
        let trace = current_trace_id().unwrap_or_else(|| "none".into());
        reply
            .send_reply(&ReplyMessage::ephemeral(format!("Pong! (trace {trace})")))
            .await
    }
}
