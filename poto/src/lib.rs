//! Poto exposes server-side handler objects as remote procedure endpoints
//! with first-class streaming responses, request-scoped context that
//! survives suspension, a type-preserving wire codec, and per-principal
//! sessions.
//!
//! ```ignore
//! use std::sync::Arc;
//! use poto::{Method, PotoConfig, PotoServer, RpcModule, Value};
//!
//! struct Counter;
//!
//! impl RpcModule for Counter {
//!     fn name(&self) -> &'static str { "Counter" }
//!     fn methods(self: &Arc<Self>) -> Vec<Method> {
//!         vec![Method::value("postIncrement_", |args| async move {
//!             let n = args[0].as_f64().unwrap_or(0.0);
//!             Ok(Value::Number(n + 1.0))
//!         })
//!         .min_args(1)]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     poto::init_tracing();
//!     let config = PotoConfig::default();
//!     PotoServer::builder(config)
//!         .register(Counter)
//!         .serve("0.0.0.0:3000")
//!         .await
//! }
//! ```

mod server;

pub use poto_codec::{
    BlobSource, BlobValue, Codec, CodecError, CodecLimits, Composite, DateValue, ElementKind,
    ErrorValue, Handle, MemoryBlob, RegExpValue, Value,
};
pub use poto_core::{
    init_tracing, Authenticator, ContextError, HandlerRegistry, MemoryPrincipalStore, Method,
    PotoConfig, Principal, PrincipalStore, RequestContext, RpcError, RpcModule, RpcResponse,
    SessionBackendKind, VISITOR_ROLE,
};
pub use poto_security::{JwtAuthenticator, SecurityError, TokenIssuer};
pub use poto_session::{
    CookieSessionBackend, MemorySessionBackend, SessionBackend, SessionError, SessionRecord,
    SessionStats, SessionStore,
};

pub use server::{session_store, PotoServer, PotoServerBuilder};
