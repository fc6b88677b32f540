//! Core runtime for Poto: per-request context propagation, the handler
//! registry, and the streaming dispatcher.

pub mod auth;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod http;
pub mod principal;

pub use auth::{bearer_token, Authenticator, NoAuthenticator};
pub use config::{ConfigError, PotoConfig, SessionBackendKind};
pub use context::{ContextError, ContextStream, RequestContext, RequestInfo};
pub use dispatch::{rpc_router, RpcState};
pub use error::RpcError;
pub use handler::{ByteStream, HandlerRegistry, Method, RpcModule, RpcResponse, ValueStream};
pub use principal::{MemoryPrincipalStore, Principal, PrincipalStore, VISITOR_ROLE};

/// Install a tracing subscriber honoring `RUST_LOG`. Safe to call once at
/// process startup.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
