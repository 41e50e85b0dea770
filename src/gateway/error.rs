//! Error taxonomy and user-facing sanitization.
//!
//! Code inside the gateway raises [`GatewayError`], which carries its
//! [`ErrorKind`] explicitly. [`classify`] passes those through untouched and
//! only falls back to message heuristics for untagged collaborator errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::context::current_trace_id;

/// Free-form key/value context attached to logs, samples and errors.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    RateLimited,
    Database,
    ExternalApi,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl ErrorKind {
    pub const ALL: [Self; 7] = [
        Self::Validation,
        Self::Auth,
        Self::NotFound,
        Self::RateLimited,
        Self::Database,
        Self::ExternalApi,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Database => "database",
            Self::ExternalApi => "external_api",
            Self::Unknown => "unknown",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Validation | Self::NotFound | Self::RateLimited => Severity::Low,
            Self::Auth | Self::ExternalApi => Severity::Medium,
            Self::Database | Self::Unknown => Severity::High,
        }
    }

    /// Generic message safe to show the caller. Never includes cause detail.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Validation => "That request wasn't valid. Please check it and try again.",
            Self::Auth => "You don't have permission to do that.",
            Self::NotFound => "We couldn't find what you were looking for.",
            Self::RateLimited => "You're doing that too often. Please wait and try again.",
            Self::Database => "We couldn't reach our data store. Please try again shortly.",
            Self::ExternalApi => "A service we rely on isn't responding. Please try again shortly.",
            Self::Unknown => "Something went wrong. Please try again later.",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Database | Self::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalApi => StatusCode::BAD_GATEWAY,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// An error raised with an explicit kind tag.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn external_api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalApi, message)
    }

    #[must_use]
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// A failure mapped onto the taxonomy. Built once by [`classify`], never mutated.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {cause:#}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    user_message: &'static str,
    cause: anyhow::Error,
    context: Metadata,
}

impl ClassifiedError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn user_message(&self) -> &'static str {
        self.user_message
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    pub fn context(&self) -> &Metadata {
        &self.context
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.context.get("trace_id").map(String::as_str)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: ErrorKind,
    trace_id: Option<&'a str>,
}

impl IntoResponse for ClassifiedError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.user_message,
            kind: self.kind,
            trace_id: self.trace_id(),
        };
        (self.kind.status_code(), Json(body)).into_response()
    }
}

/// Classify with no extra context beyond the active trace id.
pub fn classify(error: anyhow::Error) -> ClassifiedError {
    classify_with_context(error, &Metadata::new())
}

/// Map `error` onto the taxonomy, merging `extra` and the active trace id
/// into the error's context.
pub fn classify_with_context(error: anyhow::Error, extra: &Metadata) -> ClassifiedError {
    let kind = tagged_kind(&error).unwrap_or_else(|| infer_kind(&format!("{error:#}")));

    let mut context = extra.clone();
    if let Some(trace_id) = current_trace_id() {
        context.insert("trace_id".into(), trace_id);
    }

    ClassifiedError {
        kind,
        user_message: kind.user_message(),
        cause: error,
        context,
    }
}

fn tagged_kind(error: &anyhow::Error) -> Option<ErrorKind> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<GatewayError>())
        .map(GatewayError::kind)
}

/// Best-effort guess for untagged errors from outside the gateway.
fn infer_kind(message: &str) -> ErrorKind {
    let message = message.to_ascii_lowercase();
    if message.contains("database") {
        ErrorKind::Database
    } else if message.contains("permission") || message.contains("unauthorized") {
        ErrorKind::Auth
    } else if message.contains("not found") {
        ErrorKind::NotFound
    } else if message.contains("rate limit") {
        ErrorKind::RateLimited
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::context::{with_request_context, RequestContext};
    use anyhow::Context as _;
    use http_body_util::BodyExt;

    #[test]
    fn tagged_errors_pass_through() {
        for kind in ErrorKind::ALL {
            let err = anyhow::Error::new(GatewayError::new(kind, "database not found"));
            assert_eq!(classify(err).kind(), kind);
        }
    }

    #[test]
    fn tag_survives_added_context() {
        let err: anyhow::Result<()> = Err(GatewayError::validation("bad option").into());
        let err = err.context("while handling /count").unwrap_err();
        assert_eq!(classify(err).kind(), ErrorKind::Validation);
    }

    #[test]
    fn heuristics_cover_untagged_messages() {
        let cases = [
            ("Database connection refused", ErrorKind::Database),
            ("missing PERMISSION to manage roles", ErrorKind::Auth),
            ("401 Unauthorized", ErrorKind::Auth),
            ("member not found", ErrorKind::NotFound),
            ("hit rate limit on upstream", ErrorKind::RateLimited),
            ("socket hang up", ErrorKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(
                classify(anyhow::anyhow!(message)).kind(),
                expected,
                "{message}"
            );
        }
    }

    #[test]
    fn heuristics_see_whole_chain() {
        let err = anyhow::anyhow!("connection reset").context("database write failed");
        assert_eq!(classify(err).kind(), ErrorKind::Database);

        let inner = anyhow::anyhow!("user not found");
        let err = inner.context("lookup");
        assert_eq!(classify(err).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn user_message_never_leaks_cause() {
        let err = anyhow::anyhow!("database password=hunter2 rejected");
        let classified = classify(err);
        assert_eq!(classified.kind(), ErrorKind::Database);
        assert!(!classified.user_message().contains("hunter2"));
        assert!(classified.cause().to_string().contains("hunter2"));
    }

    #[test]
    fn severities_match_kinds() {
        assert_eq!(ErrorKind::Validation.severity(), Severity::Low);
        assert_eq!(ErrorKind::Auth.severity(), Severity::Medium);
        assert_eq!(ErrorKind::Database.severity(), Severity::High);
        assert_eq!(ErrorKind::Unknown.severity(), Severity::High);
    }

    #[tokio::test]
    async fn context_merges_trace_id() {
        let mut extra = Metadata::new();
        extra.insert("operation".into(), "count".into());

        let classified = with_request_context(RequestContext::new("trace-e"), async {
            classify_with_context(anyhow::anyhow!("boom"), &extra)
        })
        .await;

        assert_eq!(classified.trace_id(), Some("trace-e"));
        assert_eq!(
            classified.context().get("operation").map(String::as_str),
            Some("count")
        );
    }

    #[test]
    fn no_trace_id_outside_context() {
        assert!(classify(anyhow::anyhow!("boom")).trace_id().is_none());
    }

    #[tokio::test]
    async fn response_is_sanitized() {
        let classified = classify(GatewayError::external_api("upstream 503: token=abc").into());
        let response = classified.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["kind"], "external_api");
        assert_eq!(parsed["error"], ErrorKind::ExternalApi.user_message());
        assert!(parsed["trace_id"].is_null());
        assert!(!String::from_utf8_lossy(&body).contains("token=abc"));
    }

    #[test]
    fn gateway_error_keeps_source() {
        let io = std::io::Error::other("disk gone");
        let err = GatewayError::database("write failed").with_source(io);
        assert_eq!(err.to_string(), "write failed");
        assert!(std::error::Error::source(&err).is_some());
    }
}
