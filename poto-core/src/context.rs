//! Per-request context propagation.
//!
//! A [`RequestContext`] binds the authenticated principal, the request
//! reference, and a mutable response-header buffer to a logical task. The
//! binding rides the task lineage via `tokio::task_local!`: everything
//! invoked inside [`RequestContext::scope`], including suspended work and
//! [`RequestContext::spawn`]ed helpers, observes the same triple, and
//! concurrent requests never observe each other's.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures_core::Stream;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use pin_project_lite::pin_project;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::principal::Principal;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Raised when an operation that needs the request context runs outside
/// of one. This is a programming error and surfaces as HTTP 500.
#[derive(Debug)]
pub enum ContextError {
    NoContext,
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::NoContext => write!(f, "No request context is active"),
        }
    }
}

impl std::error::Error for ContextError {}

/// Immutable facts about the incoming request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

struct ContextInner {
    principal: Option<Arc<Principal>>,
    request: RequestInfo,
    response_headers: Mutex<HeaderMap>,
    cancel: CancellationToken,
}

/// The per-request carrier. Cheap to clone; all clones share the same
/// header buffer and cancellation token.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub fn new(principal: Option<Arc<Principal>>, request: RequestInfo) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                principal,
                request,
                response_headers: Mutex::new(HeaderMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The context bound to the current task lineage.
    pub fn current() -> Result<RequestContext, ContextError> {
        CURRENT
            .try_with(|ctx| ctx.clone())
            .map_err(|_| ContextError::NoContext)
    }

    pub fn try_current() -> Option<RequestContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Run a future with this context bound to its task lineage.
    pub async fn scope<F: std::future::Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Run a closure with this context bound, synchronously.
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.clone(), f)
    }

    /// Spawn a helper that inherits the current context. The helper sees
    /// the same triple and cancellation token as the request it descends
    /// from.
    pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match Self::try_current() {
            Some(ctx) => tokio::spawn(ctx.scope(fut)),
            None => tokio::spawn(fut),
        }
    }

    pub fn principal(&self) -> Option<&Arc<Principal>> {
        self.inner.principal.as_ref()
    }

    pub fn principal_id(&self) -> Option<&str> {
        self.inner.principal.as_deref().map(Principal::id)
    }

    pub fn request(&self) -> &RequestInfo {
        &self.inner.request
    }

    /// Append a response header. Mutations made after the response status
    /// line is written (the first streamed byte) are lost.
    pub fn append_response_header(&self, name: HeaderName, value: HeaderValue) {
        let mut headers = self.lock_headers();
        headers.append(name, value);
    }

    /// Insert a response header, replacing previous values for the name.
    pub fn insert_response_header(&self, name: HeaderName, value: HeaderValue) {
        let mut headers = self.lock_headers();
        headers.insert(name, value);
    }

    /// Snapshot of the buffered response headers.
    pub fn response_headers(&self) -> HeaderMap {
        self.lock_headers().clone()
    }

    fn lock_headers(&self) -> std::sync::MutexGuard<'_, HeaderMap> {
        self.inner
            .response_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// The cancellation token associated with this request. Transitions
    /// once when the transport signals client disconnect; never cleared.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("principal", &self.principal_id())
            .field("method", &self.inner.request.method)
            .field("uri", &self.inner.request.uri)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pin_project! {
    /// Stream adapter that re-enters the request context on every poll, so
    /// production driven from any worker observes the request's triple.
    ///
    /// Dropping the adapter before the inner stream finishes cancels the
    /// request token; the transport dropping the response body is the
    /// client-disconnect signal.
    pub struct ContextStream<S> {
        #[pin]
        inner: S,
        ctx: RequestContext,
        finished: bool,
    }

    impl<S> PinnedDrop for ContextStream<S> {
        fn drop(this: Pin<&mut Self>) {
            if !this.finished {
                this.ctx.cancel();
            }
        }
    }
}

impl<S> ContextStream<S> {
    pub fn new(ctx: RequestContext, inner: S) -> Self {
        Self {
            inner,
            ctx,
            finished: false,
        }
    }
}

impl<S: Stream> Stream for ContextStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        let inner = this.inner;
        let polled = this.ctx.sync_scope(|| inner.poll_next(cx));
        if let Poll::Ready(None) = polled {
            *this.finished = true;
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn test_ctx(principal_id: &str) -> RequestContext {
        let principal = Arc::new(Principal::new(principal_id, ["user"]));
        RequestContext::new(
            Some(principal),
            RequestInfo {
                method: Method::POST,
                uri: Uri::from_static("/test/run"),
                headers: HeaderMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn current_sees_the_scoped_context() {
        let ctx = test_ctx("alice");
        ctx.clone()
            .scope(async {
                let seen = RequestContext::current().unwrap();
                assert_eq!(seen.principal_id(), Some("alice"));
            })
            .await;
        assert!(RequestContext::current().is_err());
    }

    #[tokio::test]
    async fn concurrent_scopes_are_isolated() {
        let mut tasks = Vec::new();
        for i in 0..16 {
            let id = format!("user-{i}");
            let ctx = test_ctx(&id);
            tasks.push(tokio::spawn(ctx.scope(async move {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    let seen = RequestContext::current().unwrap();
                    assert_eq!(seen.principal_id(), Some(id.as_str()));
                }
            })));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn spawned_helpers_inherit_the_context() {
        let ctx = test_ctx("carol");
        ctx.clone()
            .scope(async {
                let handle = RequestContext::spawn(async {
                    RequestContext::current().unwrap().principal_id().map(String::from)
                });
                assert_eq!(handle.await.unwrap().as_deref(), Some("carol"));
            })
            .await;
    }

    #[tokio::test]
    async fn context_stream_restores_context_per_poll() {
        let ctx = test_ctx("dave");
        let stream = futures_util::stream::iter(0..3).map(|i| {
            let seen = RequestContext::current().unwrap();
            (i, seen.principal_id().map(String::from))
        });
        // Drive the adapter outside any scope: each poll re-enters.
        let mut adapted = ContextStream::new(ctx, stream);
        while let Some((_, principal)) = adapted.next().await {
            assert_eq!(principal.as_deref(), Some("dave"));
        }
    }

    #[tokio::test]
    async fn dropping_an_unfinished_stream_cancels_the_request() {
        let ctx = test_ctx("erin");
        let stream = futures_util::stream::iter(0..100).map(|i| i);
        let mut adapted = ContextStream::new(ctx.clone(), stream);
        let _ = adapted.next().await;
        drop(adapted);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn finished_streams_do_not_cancel() {
        let ctx = test_ctx("frank");
        let stream = futures_util::stream::iter(0..2);
        let mut adapted = ContextStream::new(ctx.clone(), stream);
        while adapted.next().await.is_some() {}
        drop(adapted);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn header_buffer_is_shared_across_clones() {
        let ctx = test_ctx("gail");
        let clone = ctx.clone();
        clone.append_response_header(
            HeaderName::from_static("x-poto-test"),
            HeaderValue::from_static("1"),
        );
        assert_eq!(
            ctx.response_headers().get("x-poto-test"),
            Some(&HeaderValue::from_static("1"))
        );
    }
}
