//! Axum-based HTTP gateway: webhook and command ingress.
//!
//! Every route runs under the trace-context middleware, a body size limit and
//! a request timeout. `POST /webhook` is gated by signature verification and
//! `POST /commands/{name}` by the per-principal rate limiter; both hand off
//! to [`GatewayDispatcher`] for the measure + classify envelope.

pub mod context;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod webhook;

pub use context::{current_trace_id, with_request_context, RequestContext, REQUEST_ID_HEADER};
pub use dispatch::{
    BufferedReply, CommandInvocation, CommandOutcome, DispatchRequest, GatewayDispatcher,
    ReplyChannel, ReplyMessage,
};
pub use error::{classify, ClassifiedError, ErrorKind, GatewayError, Metadata, Severity};
pub use metrics::{MetricSample, MetricsRecorder, OperationStats};
pub use rate_limit::{DenialReason, RateLimitDecision, RateLimiter};
pub use webhook::{AcknowledgeWebhook, WebhookAuth, WebhookHandler, WebhookPayload, WebhookPolicy};

use crate::commands::CommandRegistry;
use crate::config::Config;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<GatewayDispatcher>,
    pub commands: Arc<CommandRegistry>,
    pub webhook_handler: Arc<dyn WebhookHandler>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<GatewayDispatcher>,
        commands: CommandRegistry,
        webhook_handler: Arc<dyn WebhookHandler>,
    ) -> Self {
        Self {
            dispatcher,
            commands: Arc::new(commands),
            webhook_handler,
            started_at: Instant::now(),
        }
    }
}

/// Router with all routes and layers, ready to serve.
pub fn build_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/webhook", post(handle_webhook))
        .route("/commands/{name}", post(handle_command))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.gateway.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.gateway.request_timeout_secs.max(1)),
        ))
        .layer(middleware::from_fn(context::trace_context))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(
    config: Config,
    commands: CommandRegistry,
    webhook_handler: Arc<dyn WebhookHandler>,
) -> Result<()> {
    let dispatcher = Arc::new(GatewayDispatcher::from_config(&config));
    let policy = dispatcher.webhook_policy();
    if !policy.has_secret() {
        if policy.require_signature() {
            tracing::error!("signatures required but no webhook secret set; webhooks will fail");
        } else {
            tracing::warn!("no webhook secret configured; webhooks are accepted unverified");
        }
    }

    let sweeper = dispatcher.rate_limiter().spawn_sweeper(Duration::from_secs(
        config.rate_limit.sweep_interval_secs.max(1),
    ));

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid gateway address {}:{}",
                config.gateway.host, config.gateway.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {addr}"))?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(dispatcher, commands, webhook_handler);
    let command_names = state.commands.names().join(", ");
    let app = build_router(state, &config);

    tracing::info!(%local_addr, commands = %command_names, "gateway listening");
    println!("botgate listening on http://{local_addr}");
    println!("  POST /webhook            signed webhook deliveries");
    println!("  POST /commands/{{name}}    {{\"principal_id\": \"...\", \"options\": {{}}}}");
    println!("  GET  /health             health check");
    println!("  GET  /metrics            in-memory operation stats");
    println!("  Press Ctrl+C to stop.\n");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited unexpectedly");

    sweeper.abort();
    tracing::info!("gateway stopped");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public, no secrets leaked
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "tracked_principals": state.dispatcher.rate_limiter().tracked_principals(),
    });
    Json(body)
}

/// GET /metrics: per-operation stats from the in-memory ring buffer
async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.dispatcher.metrics();
    let body = serde_json::json!({
        "capacity": metrics.capacity(),
        "total_samples": metrics.len(),
        "operations": metrics.operations(),
    });
    Json(body)
}

/// POST /webhook
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth = match state.dispatcher.verify_webhook(&headers, &body) {
        Ok(auth) => auth,
        Err(rejection) => return rejection.into_response(),
    };

    let payload = WebhookPayload {
        body,
        headers,
        auth,
    };
    let request = DispatchRequest::new("webhook").with_metadata("auth", auth.as_str());
    let handler = Arc::clone(&state.webhook_handler);

    match state
        .dispatcher
        .dispatch(request, None, handler.handle(payload))
        .await
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(classified) => classified.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub principal_id: String,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// POST /commands/{name}
async fn handle_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<CommandBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("command JSON parse error: {e}");
            let error = GatewayError::validation("invalid command body");
            return classify(error.with_source(e).into()).into_response();
        }
    };

    let principal_id = body.principal_id.trim();
    if principal_id.is_empty() {
        return classify(GatewayError::validation("principal_id is empty").into()).into_response();
    }

    let Some(handler) = state.commands.get(&name) else {
        tracing::warn!(command = %name, "unknown command");
        return classify(GatewayError::not_found(format!("unknown command '{name}'")).into())
            .into_response();
    };

    let invocation = CommandInvocation {
        principal_id: principal_id.to_owned(),
        command: handler.name().to_owned(),
        options: body.options,
        trace_id: current_trace_id(),
    };
    let reply = BufferedReply::new();

    let outcome = state
        .dispatcher
        .dispatch_command(&invocation, &reply, handler.execute(&invocation, &reply))
        .await;

    let replies = reply.messages();
    match outcome {
        CommandOutcome::Completed => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "completed", "replies": replies})),
        )
            .into_response(),
        CommandOutcome::RateLimited {
            retry_after_secs,
            reason,
        } => {
            let body = serde_json::json!({
                "status": "rate_limited",
                "reason": reason.as_str(),
                "retry_after": retry_after_secs,
                "replies": replies,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Some(secs) = retry_after_secs {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            response
        }
        CommandOutcome::Failed(classified) => {
            let body = serde_json::json!({
                "status": "failed",
                "error": classified.user_message(),
                "kind": classified.kind(),
                "trace_id": classified.trace_id(),
                "replies": replies,
            });
            (classified.kind().status_code(), Json(body)).into_response()
        }
    }
}
