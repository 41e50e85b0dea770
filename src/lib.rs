//! Ingress gateway shared by the bot's webhook endpoint and its command
//! pipeline.
//!
//! - [`security`]: HMAC-SHA256 webhook signatures.
//! - [`gateway`]: rate limiting, request trace context, error classification,
//!   metrics, the dispatcher, and the axum server.
//! - [`commands`]: the seam command handlers register through.

pub mod commands;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod security;

pub use config::Config;
pub use gateway::{
    build_router, run_gateway, AppState, ClassifiedError, CommandOutcome, ErrorKind,
    GatewayDispatcher, GatewayError, MetricsRecorder, RateLimitDecision, RateLimiter,
    RequestContext,
};
