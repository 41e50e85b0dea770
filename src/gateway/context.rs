//! Ambient request trace id.
//!
//! The id lives in a tokio task-local, so it follows the future it was
//! scoped onto across every `.await` and never leaks into another task's
//! call tree. Spawned tasks start with no context; wrap them with
//! [`in_current_context`] to carry it across.

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::future::Future;
use tracing::Instrument;

/// Header carrying the trace id in and out of the gateway.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
/// Longest inbound trace id we are willing to reuse.
pub const MAX_INBOUND_TRACE_ID_LENGTH: usize = 128;
/// Random bytes in a generated trace id (hex-encoded to twice this length).
const TRACE_ID_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: String,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// Context with a freshly generated trace id.
    pub fn generate() -> Self {
        Self::new(generate_trace_id())
    }
}

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Run `fut` with `ctx` as the ambient request context.
pub async fn with_request_context<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    REQUEST_CONTEXT.scope(ctx, fut).await
}

/// Synchronous counterpart of [`with_request_context`].
pub fn with_request_context_sync<R>(ctx: RequestContext, f: impl FnOnce() -> R) -> R {
    REQUEST_CONTEXT.sync_scope(ctx, f)
}

pub fn current_request_context() -> Option<RequestContext> {
    REQUEST_CONTEXT.try_with(Clone::clone).ok()
}

pub fn current_trace_id() -> Option<String> {
    REQUEST_CONTEXT.try_with(|ctx| ctx.trace_id.clone()).ok()
}

/// Capture the caller's context (if any) so `fut` sees it even after being
/// handed to `tokio::spawn`.
pub fn in_current_context<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let ctx = current_request_context();
    async move {
        match ctx {
            Some(ctx) => REQUEST_CONTEXT.scope(ctx, fut).await,
            None => fut.await,
        }
    }
}

/// 32 lowercase hex characters from the thread-local CSPRNG.
pub fn generate_trace_id() -> String {
    let bytes: [u8; TRACE_ID_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Reuse the inbound `X-Request-ID` when it is a sane token, otherwise mint
/// a new id.
pub fn resolve_trace_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize_inbound_trace_id)
        .unwrap_or_else(generate_trace_id)
}

fn sanitize_inbound_trace_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_INBOUND_TRACE_ID_LENGTH {
        return None;
    }
    trimmed
        .chars()
        .all(is_tchar)
        .then(|| trimmed.to_owned())
}

/// HTTP token character (RFC 9110 `tchar`).
const fn is_tchar(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

/// Axum middleware: resolve the trace id, run the rest of the stack inside
/// its scope and a `request` span, and echo the id on the response.
pub async fn trace_context(request: Request, next: Next) -> Response {
    let trace_id = resolve_trace_id(request.headers());
    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let context = RequestContext::new(trace_id.clone());
    let mut response = with_request_context(context, next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn nested_read() -> Option<String> {
        tokio::task::yield_now().await;
        deeper_read().await
    }

    async fn deeper_read() -> Option<String> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        current_trace_id()
    }

    #[test]
    fn no_context_returns_none() {
        assert!(current_trace_id().is_none());
        assert!(current_request_context().is_none());
    }

    #[tokio::test]
    async fn nested_calls_see_scoped_id() {
        let seen = with_request_context(RequestContext::new("trace-a"), async {
            let direct = current_trace_id();
            let nested = nested_read().await;
            (direct, nested)
        })
        .await;

        assert_eq!(seen.0.as_deref(), Some("trace-a"));
        assert_eq!(seen.1.as_deref(), Some("trace-a"));
        assert!(current_trace_id().is_none(), "scope must end with the call");
    }

    #[tokio::test]
    async fn interleaved_call_trees_do_not_cross_talk() {
        async fn tree(id: &'static str, pause_ms: u64) -> Vec<Option<String>> {
            with_request_context(RequestContext::new(id), async move {
                let mut seen = vec![current_trace_id()];
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                    seen.push(nested_read().await);
                    tokio::task::yield_now().await;
                    seen.push(current_trace_id());
                }
                seen
            })
            .await
        }

        // current_thread runtime: both trees interleave on one thread.
        let (a, b) = tokio::join!(tree("trace-a", 1), tree("trace-b", 2));

        assert!(a.iter().all(|id| id.as_deref() == Some("trace-a")), "{a:?}");
        assert!(b.iter().all(|id| id.as_deref() == Some("trace-b")), "{b:?}");
    }

    #[tokio::test]
    async fn inner_scope_shadows_outer_and_restores() {
        with_request_context(RequestContext::new("outer"), async {
            let inner = with_request_context(RequestContext::new("inner"), async {
                current_trace_id()
            })
            .await;
            assert_eq!(inner.as_deref(), Some("inner"));
            assert_eq!(current_trace_id().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn spawned_task_needs_explicit_propagation() {
        let (plain, carried) = with_request_context(RequestContext::new("trace-spawn"), async {
            let plain = tokio::spawn(async { current_trace_id() }).await.unwrap();
            let carried = tokio::spawn(in_current_context(async { current_trace_id() }))
                .await
                .unwrap();
            (plain, carried)
        })
        .await;

        assert!(plain.is_none());
        assert_eq!(carried.as_deref(), Some("trace-spawn"));
    }

    #[test]
    fn sync_scope_is_visible() {
        let seen = with_request_context_sync(RequestContext::new("sync-id"), current_trace_id);
        assert_eq!(seen.as_deref(), Some("sync-id"));
        assert!(current_trace_id().is_none());
    }

    #[test]
    fn generated_ids_are_long_random_hex() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn inbound_header_is_reused() {
        let mut headers = HeaderMap::new();
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_static("  upstream-123  "),
        );
        assert_eq!(resolve_trace_id(&headers), "upstream-123");
    }

    #[test]
    fn invalid_inbound_header_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("has space"));
        let id = resolve_trace_id(&headers);
        assert_ne!(id, "has space");
        assert_eq!(id.len(), 32);

        let long = "a".repeat(MAX_INBOUND_TRACE_ID_LENGTH + 1);
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(&long).unwrap());
        assert_eq!(resolve_trace_id(&headers).len(), 32);

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("   "));
        assert_eq!(resolve_trace_id(&headers).len(), 32);
    }

    #[test]
    fn missing_header_generates_id() {
        assert_eq!(resolve_trace_id(&HeaderMap::new()).len(), 32);
    }
}
