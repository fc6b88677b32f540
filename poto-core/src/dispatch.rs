//! Method dispatch and streaming transport.
//!
//! Maps `<VERB> /<handler>/<method>` onto a registered module method,
//! decodes the argument envelope, invokes the method inside a request
//! context, and frames the result: a single JSON body, a server-sent-event
//! stream of encoded values, or a raw byte stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use poto_codec::{Codec, Composite, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::context::{ContextStream, RequestContext, RequestInfo};
use crate::error::RpcError;
use crate::handler::{ByteStream, HandlerRegistry, RpcResponse, ValueStream};

/// Terminal frame signalling successful completion of an event stream.
const DONE_FRAME: &str = r#"{"__done":true}"#;

/// Shared dispatcher state: the append-only registry, the authentication
/// seam, and the codec with its configured limits.
#[derive(Clone)]
pub struct RpcState {
    registry: Arc<HandlerRegistry>,
    authenticator: Arc<dyn Authenticator>,
    codec: Codec,
}

impl RpcState {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        authenticator: Arc<dyn Authenticator>,
        codec: Codec,
    ) -> Self {
        Self {
            registry,
            authenticator,
            codec,
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }
}

/// Build the RPC dispatch router over `/{handler}/{method}`.
pub fn rpc_router(state: RpcState) -> Router {
    Router::new()
        .route("/{handler}/{method}", any(dispatch))
        .with_state(state)
}

async fn dispatch(
    State(state): State<RpcState>,
    Path((handler_seg, method_seg)): Path<(String, String)>,
    req: Request,
) -> Response {
    let Some(handler) = state.registry.get(&handler_seg.to_lowercase()) else {
        return RpcError::NotFound(format!("Unknown handler {handler_seg}")).into_response();
    };
    let Some(method) = handler.method(req.method(), &method_seg.to_lowercase()) else {
        return RpcError::NotFound(format!(
            "Unknown method {method_seg} on handler {}",
            handler.name()
        ))
        .into_response();
    };

    let principal = state.authenticator.authenticate(req.headers()).await;

    if !method.required_roles().is_empty() {
        let roles = method.required_roles().join(", ");
        match &principal {
            None => {
                return RpcError::Unauthorized(format!(
                    "Method {} requires roles [{roles}]",
                    method.raw_name()
                ))
                .into_response();
            }
            Some(p) if !method.required_roles().iter().any(|r| p.has_role(r)) => {
                warn!(
                    principal = p.id(),
                    method = method.raw_name(),
                    "principal lacks the required roles"
                );
                return RpcError::Forbidden(format!(
                    "Method {} requires roles [{roles}]",
                    method.raw_name()
                ))
                .into_response();
            }
            _ => {}
        }
    }

    let (parts, body) = req.into_parts();
    let args = match read_args(&state.codec, &parts, body).await {
        Ok(args) => args,
        Err(e) => return e.into_response(),
    };
    if args.len() < method.required_args() {
        return RpcError::BadRequest(format!(
            "Method {} expects at least {} arguments, got {}",
            method.raw_name(),
            method.required_args(),
            args.len()
        ))
        .into_response();
    }

    debug!(
        handler = handler.name(),
        method = method.raw_name(),
        principal = principal.as_deref().map(|p| p.id()),
        args = args.len(),
        "dispatching rpc call"
    );

    let ctx = RequestContext::new(
        principal,
        RequestInfo {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        },
    );

    // If the transport drops us mid-invoke (client disconnect), the guard
    // cancels the token so spawned helpers observe it.
    let guard = ctx.cancellation().drop_guard();
    let result = ctx.clone().scope(method.invoke(args)).await;
    let _ = guard.disarm();

    match result {
        Err(e) => {
            warn!(method = method.raw_name(), error = %e, "handler failed before first byte");
            error_with_headers(&ctx, e)
        }
        Ok(RpcResponse::Value(value)) => scalar_response(&state.codec, &ctx, value).await,
        Ok(RpcResponse::Stream(stream)) => event_stream_response(state.codec.clone(), ctx, stream),
        Ok(RpcResponse::Bytes(stream)) => byte_stream_response(ctx, stream),
    }
}

/// Decode the positional-argument envelope: a JSON array in the body for
/// POST/PUT/PATCH, or in the single `args` query parameter for GET/DELETE.
async fn read_args(
    codec: &Codec,
    parts: &http::request::Parts,
    body: Body,
) -> Result<Vec<Value>, RpcError> {
    let text = if parts.method == http::Method::GET || parts.method == http::Method::DELETE {
        let query = parts.uri.query().unwrap_or("");
        match form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == "args") {
            Some((_, v)) => v.into_owned(),
            None => return Ok(Vec::new()),
        }
    } else {
        let limit = codec.limits().max_blob_bytes;
        let bytes = to_bytes(body, limit)
            .await
            .map_err(|e| RpcError::BadRequest(format!("unreadable request body: {e}")))?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RpcError::BadRequest("request body is not UTF-8".into()))?
    };

    let decoded = codec
        .decode_str(&text)
        .map_err(|e| RpcError::BadRequest(format!("malformed argument envelope: {e}")))?;
    match decoded {
        Value::Composite(handle) => match &*handle.read() {
            Composite::Array(items) => Ok(items.clone()),
            _ => Err(RpcError::BadRequest(
                "argument envelope must be a JSON array".into(),
            )),
        },
        _ => Err(RpcError::BadRequest(
            "argument envelope must be a JSON array".into(),
        )),
    }
}

/// Apply the carrier's buffered headers onto a response being built.
fn apply_context_headers(target: &mut HeaderMap, ctx: &RequestContext) {
    for (name, value) in ctx.response_headers().iter() {
        target.append(name.clone(), value.clone());
    }
}

fn error_with_headers(ctx: &RequestContext, err: RpcError) -> Response {
    let mut response = err.into_response();
    let mut buffered = ctx.response_headers();
    // The error framing owns the content type.
    buffered.remove(header::CONTENT_TYPE);
    for (name, value) in buffered.iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

async fn scalar_response(codec: &Codec, ctx: &RequestContext, value: Value) -> Response {
    let encoded = match codec.encode_to_string_async(&value).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode handler result");
            return error_with_headers(ctx, RpcError::from(e));
        }
    };
    let mut response = (StatusCode::OK, encoded).into_response();
    apply_context_headers(response.headers_mut(), ctx);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Frame a lazy sequence as server-sent events. A context-scoped driver
/// task pulls one element at a time through a bounded channel, so the
/// dispatcher awaits each chunk before requesting the next. Dropping the
/// response body (client disconnect) cancels the request token and drops
/// the handler's stream, which runs its cleanup.
fn event_stream_response(codec: Codec, ctx: RequestContext, stream: ValueStream) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
    let driver_ctx = ctx.clone();
    tokio::spawn(driver_ctx.clone().scope(drive_events(
        codec,
        driver_ctx,
        stream,
        tx,
    )));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    apply_context_headers(response.headers_mut(), &ctx);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn sse_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

async fn drive_events(
    codec: Codec,
    ctx: RequestContext,
    mut stream: ValueStream,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    loop {
        let item = tokio::select! {
            _ = ctx.cancelled() => {
                debug!("event stream cancelled; dropping remaining chunks");
                break;
            }
            item = stream.next() => item,
        };

        // (frame, terminal)
        let (frame, terminal) = match item {
            None => (sse_frame(DONE_FRAME), true),
            Some(Ok(value)) => match codec.encode_to_string(&value) {
                Ok(text) => (sse_frame(&text), false),
                Err(e) => {
                    warn!(error = %e, "failed to encode stream element");
                    (sse_frame(&RpcError::from(e).to_envelope_text()), true)
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "handler failed mid-stream");
                (sse_frame(&e.to_envelope_text()), true)
            }
        };

        if tx.send(Ok(frame)).await.is_err() {
            // Receiver gone: the client disconnected.
            ctx.cancel();
            break;
        }
        if terminal {
            break;
        }
    }
    // The handler's stream is dropped here on every exit path.
}

/// Frame raw bytes as an HTTP body. The content type defaults to
/// `application/octet-stream`; a handler may override it through the
/// carrier's header buffer before returning the stream.
fn byte_stream_response(ctx: RequestContext, stream: ByteStream) -> Response {
    let scoped = ContextStream::new(ctx.clone(), stream);
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(scoped))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    apply_context_headers(response.headers_mut(), &ctx);
    let headers = response.headers_mut();
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }
    response
}
