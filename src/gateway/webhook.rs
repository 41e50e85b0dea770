//! Webhook verification policy and the handler seam business code plugs into.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::fmt;
use std::sync::Arc;

use super::context::current_trace_id;
use super::error::GatewayError;
use crate::config::WebhookConfig;
use crate::security::{extract_signature, verify_signature};

/// How a webhook request got past verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAuth {
    /// Signature present and valid.
    Verified,
    /// No secret configured and strict mode off.
    UnverifiedNoSecret,
    /// Secret configured but no signature header, strict mode off.
    UnverifiedMissingSignature,
}

impl WebhookAuth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::UnverifiedNoSecret => "unverified_no_secret",
            Self::UnverifiedMissingSignature => "unverified_missing_signature",
        }
    }

    pub fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Terminal ingress decision; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WebhookRejection {
    #[error("missing webhook signature")]
    MissingSignature,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("webhook signature required but no secret is configured")]
    SecretNotConfigured,
}

impl WebhookRejection {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::SecretNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        let error = match self {
            Self::MissingSignature | Self::InvalidSignature => "Unauthorized",
            Self::SecretNotConfigured => "Internal server error",
        };
        let body = serde_json::json!({
            "error": error,
            "trace_id": current_trace_id(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookPolicy {
    secret: Option<Arc<str>>,
    require_signature: bool,
}

impl fmt::Debug for WebhookPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookPolicy")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("require_signature", &self.require_signature)
            .finish()
    }
}

impl WebhookPolicy {
    /// A whitespace-only `secret` counts as unset. Any other value is used
    /// byte-for-byte as the HMAC key, surrounding whitespace included.
    pub fn new(secret: Option<&str>, require_signature: bool) -> Self {
        Self {
            secret: secret
                .filter(|secret| !secret.trim().is_empty())
                .map(Arc::from),
            require_signature,
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.secret.as_deref(), config.require_signature)
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn require_signature(&self) -> bool {
        self.require_signature
    }

    /// Apply the verification policy to one inbound delivery.
    pub fn evaluate(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookAuth, WebhookRejection> {
        let Some(secret) = self.secret.as_deref() else {
            if self.require_signature {
                tracing::error!("webhook signature required but no secret is configured");
                return Err(WebhookRejection::SecretNotConfigured);
            }
            tracing::warn!("webhook secret not configured; accepting unverified delivery");
            return Ok(WebhookAuth::UnverifiedNoSecret);
        };

        let Some(signature) = extract_signature(headers) else {
            if self.require_signature {
                tracing::warn!("webhook rejected: missing signature header");
                return Err(WebhookRejection::MissingSignature);
            }
            tracing::warn!("webhook signature missing; strict mode off, accepting");
            return Ok(WebhookAuth::UnverifiedMissingSignature);
        };

        if verify_signature(body, signature, secret) {
            Ok(WebhookAuth::Verified)
        } else {
            tracing::warn!("webhook rejected: invalid signature");
            Err(WebhookRejection::InvalidSignature)
        }
    }
}

/// One accepted webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookPayload {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub auth: WebhookAuth,
}

impl WebhookPayload {
    /// Body parsed as JSON; a parse failure is a validation error.
    pub fn json(&self) -> Result<serde_json::Value, GatewayError> {
        serde_json::from_slice(&self.body).map_err(invalid_json)
    }
}

fn invalid_json(error: serde_json::Error) -> GatewayError {
    GatewayError::validation("webhook body is not valid JSON")
        .with_source(error)
}

/// Business logic behind `POST /webhook`.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, payload: WebhookPayload) -> anyhow::Result<serde_json::Value>;
}

/// Accepts any JSON payload and echoes its `event` field back.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeWebhook;

#[async_trait]
impl WebhookHandler for AcknowledgeWebhook {
    async fn handle(&self, payload: WebhookPayload) -> anyhow::Result<serde_json::Value> {
        let value = payload.json()?;
        let event = value
            .get("event")
            .or_else(|| value.get("type"))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        tracing::info!(event = %event, auth = payload.auth.as_str(), "webhook accepted");
        Ok(serde_json::json!({"status": "accepted", "event": event}))
    }
}
