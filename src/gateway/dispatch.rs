//! The measure + classify envelope around every business handler.
//!
//! Webhook deliveries are gated by [`WebhookPolicy`], command interactions by
//! the [`RateLimiter`]. Either way the handler runs inside a request context,
//! is timed by the [`MetricsRecorder`], and any failure is classified, logged
//! and (best effort) reported back over the caller's reply channel.

use async_trait::async_trait;
use axum::http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

use super::context::{current_trace_id, generate_trace_id, with_request_context, RequestContext};
use super::error::{classify_with_context, ClassifiedError, Metadata};
use super::metrics::MetricsRecorder;
use super::rate_limit::{DenialReason, RateLimitDecision, RateLimiter};
use super::webhook::{WebhookAuth, WebhookPolicy, WebhookRejection};
use crate::config::Config;

/// A message sent back to whoever issued the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyMessage {
    pub content: String,
    /// Visible only to the caller.
    pub ephemeral: bool,
}

impl ReplyMessage {
    pub fn public(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: false,
        }
    }

    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: true,
        }
    }
}

/// The acknowledgment channel of one interaction.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    /// Whether an initial reply or deferral has already been sent.
    fn is_acknowledged(&self) -> bool;

    async fn send_reply(&self, message: &ReplyMessage) -> anyhow::Result<()>;

    /// Replace the existing acknowledgment.
    async fn edit_reply(&self, message: &ReplyMessage) -> anyhow::Result<()>;
}

/// Reply channel that collects messages in memory, for HTTP command ingress.
#[derive(Debug, Default)]
pub struct BufferedReply {
    messages: Mutex<Vec<ReplyMessage>>,
}

impl BufferedReply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ReplyMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl ReplyChannel for BufferedReply {
    fn is_acknowledged(&self) -> bool {
        !self.messages.lock().is_empty()
    }

    async fn send_reply(&self, message: &ReplyMessage) -> anyhow::Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn edit_reply(&self, message: &ReplyMessage) -> anyhow::Result<()> {
        let mut messages = self.messages.lock();
        match messages.last_mut() {
            Some(last) => *last = message.clone(),
            None => anyhow::bail!("no reply to edit"),
        }
        Ok(())
    }
}

/// What the dispatcher needs to know about one handler invocation.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub operation: String,
    /// Reuse this trace id; otherwise the ambient one, otherwise a new one.
    pub trace_id: Option<String>,
    pub metadata: Metadata,
}

impl DispatchRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A command interaction: who is calling, and what.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub principal_id: String,
    pub command: String,
    pub options: BTreeMap<String, serde_json::Value>,
    pub trace_id: Option<String>,
}

impl CommandInvocation {
    pub fn new(principal_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            command: command.into(),
            options: BTreeMap::new(),
            trace_id: None,
        }
    }

    pub fn option_str(&self, name: &str) -> Option<&str> {
        self.options.get(name).and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug)]
pub enum CommandOutcome {
    Completed,
    RateLimited {
        retry_after_secs: Option<u64>,
        reason: DenialReason,
    },
    Failed(ClassifiedError),
}

/// Transient message shown to a caller who was rate limited.
pub fn rate_limit_message(retry_after_secs: Option<u64>) -> String {
    match retry_after_secs {
        Some(1) => "You're doing that too fast. Try again in 1 second.".to_string(),
        Some(secs) => format!("You're doing that too fast. Try again in {secs} seconds."),
        None => "You're doing that too fast. Please slow down.".to_string(),
    }
}

#[derive(Debug)]
pub struct GatewayDispatcher {
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRecorder>,
    webhook_policy: WebhookPolicy,
}

impl GatewayDispatcher {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRecorder>,
        webhook_policy: WebhookPolicy,
    ) -> Self {
        Self {
            rate_limiter,
            metrics,
            webhook_policy,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(RateLimiter::from_config(&config.rate_limit)),
            Arc::new(MetricsRecorder::from_config(&config.metrics)),
            WebhookPolicy::from_config(&config.webhook),
        )
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn webhook_policy(&self) -> &WebhookPolicy {
        &self.webhook_policy
    }

    /// Signature gate for webhook ingress. Runs before any handler.
    pub fn verify_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookAuth, WebhookRejection> {
        self.webhook_policy.evaluate(headers, body)
    }

    /// Run `handler` inside a request context and the measure + classify
    /// envelope.
    ///
    /// On failure the error is classified, logged with the trace id, and its
    /// sanitized message is delivered over `reply` if one is given. Delivery
    /// problems are logged and dropped.
    pub async fn dispatch<F, T>(
        &self,
        request: DispatchRequest,
        reply: Option<&dyn ReplyChannel>,
        handler: F,
    ) -> Result<T, ClassifiedError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let trace_id = request
            .trace_id
            .clone()
            .or_else(current_trace_id)
            .unwrap_or_else(generate_trace_id);

        let span = tracing::info_span!(
            "dispatch",
            trace_id = %trace_id,
            operation = %request.operation,
        );

        with_request_context(RequestContext::new(trace_id), async move {
            match self
                .metrics
                .measure(&request.operation, request.metadata.clone(), handler)
                .await
            {
                Ok(value) => Ok(value),
                Err(error) => {
                    let classified = self.surface_failure(&request, error, reply).await;
                    Err(classified)
                }
            }
        })
        .instrument(span)
        .await
    }

    /// Rate-limit gate plus [`dispatch`](Self::dispatch) for one command.
    ///
    /// A denied call never reaches `handler`; the caller gets a transient
    /// message with the retry delay instead.
    pub async fn dispatch_command<F>(
        &self,
        invocation: &CommandInvocation,
        reply: &dyn ReplyChannel,
        handler: F,
    ) -> CommandOutcome
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let trace_id = invocation
            .trace_id
            .clone()
            .or_else(current_trace_id)
            .unwrap_or_else(generate_trace_id);
        let span = tracing::info_span!(
            "command",
            trace_id = %trace_id,
            principal = %invocation.principal_id,
            command = %invocation.command,
        );

        with_request_context(RequestContext::new(trace_id), async {
            let decision = self
                .rate_limiter
                .check(&invocation.principal_id, &invocation.command);

            if let RateLimitDecision::Denied {
                retry_after_secs,
                reason,
            } = decision
            {
                tracing::info!(
                    principal = %invocation.principal_id,
                    command = %invocation.command,
                    retry_after_secs,
                    reason = reason.as_str(),
                    "command rate limited"
                );
                let message = ReplyMessage::ephemeral(rate_limit_message(Some(retry_after_secs)));
                deliver(reply, &message).await;
                return CommandOutcome::RateLimited {
                    retry_after_secs: Some(retry_after_secs),
                    reason,
                };
            }

            let request = DispatchRequest::new(format!("command.{}", invocation.command))
                .with_metadata("principal_id", invocation.principal_id.clone())
                .with_metadata("command", invocation.command.clone());

            match self.dispatch(request, Some(reply), handler).await {
                Ok(()) => CommandOutcome::Completed,
                Err(classified) => CommandOutcome::Failed(classified),
            }
        })
        .instrument(span)
        .await
    }

    async fn surface_failure(
        &self,
        request: &DispatchRequest,
        error: anyhow::Error,
        reply: Option<&dyn ReplyChannel>,
    ) -> ClassifiedError {
        let mut context = request.metadata.clone();
        context.insert("operation".into(), request.operation.clone());
        let classified = classify_with_context(error, &context);

        tracing::error!(
            trace_id = classified.trace_id().unwrap_or_default(),
            operation = %request.operation,
            kind = %classified.kind(),
            severity = %classified.severity(),
            metadata = ?request.metadata,
            error = %format!("{:#}", classified.cause()),
            "handler failed"
        );

        if let Some(reply) = reply {
            deliver(reply, &ReplyMessage::ephemeral(classified.user_message())).await;
        }
        classified
    }
}

/// Edit the existing acknowledgment if there is one, otherwise send fresh.
/// Failures are logged and swallowed.
async fn deliver(reply: &dyn ReplyChannel, message: &ReplyMessage) {
    let result = if reply.is_acknowledged() {
        reply.edit_reply(message).await
    } else {
        reply.send_reply(message).await
    };
    if let Err(e) = result {
        tracing::warn!(error = %format!("{e:#}"), "failed to deliver reply");
    }
}
