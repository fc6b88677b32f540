//! Server assembly: configuration → stores → routers.

use std::sync::Arc;

use axum::Router;
use poto_codec::Codec;
use poto_core::config::{PotoConfig, SessionBackendKind};
use poto_core::dispatch::{rpc_router, RpcState};
use poto_core::handler::{HandlerRegistry, RpcModule};
use poto_core::principal::{MemoryPrincipalStore, PrincipalStore};
use poto_security::login::{login_router, AuthState};
use poto_security::{JwtAuthenticator, TokenIssuer};
use poto_session::{CookieSessionBackend, MemorySessionBackend, SessionError, SessionStore};
use tracing::info;

/// Build the session store named by the configuration. Handlers hold the
/// store as immutable configuration; the current principal always comes
/// from the request context.
pub fn session_store(config: &PotoConfig) -> Result<SessionStore, SessionError> {
    let store = match config.session_backend {
        SessionBackendKind::Memory => SessionStore::new(Arc::new(MemorySessionBackend::new(
            config.session_max_age(),
        ))),
        SessionBackendKind::Cookie => SessionStore::new(Arc::new(CookieSessionBackend::new(
            &config.secret,
            Codec::new(config.codec_limits()),
            config.session_max_age(),
            config.cookie_secure,
        )?)),
    };
    Ok(store)
}

/// Entry point for assembling a Poto server.
pub struct PotoServer;

impl PotoServer {
    pub fn builder(config: PotoConfig) -> PotoServerBuilder {
        PotoServerBuilder {
            config,
            registry: HandlerRegistry::new(),
            principal_store: Arc::new(MemoryPrincipalStore::new()),
        }
    }
}

/// Builder wiring handlers, the principal store, and the login surface
/// into one router.
pub struct PotoServerBuilder {
    config: PotoConfig,
    registry: HandlerRegistry,
    principal_store: Arc<dyn PrincipalStore>,
}

impl PotoServerBuilder {
    /// Swap in the capability interface used for principal lookup and
    /// visitor registration. Defaults to an in-memory store.
    pub fn principal_store(mut self, store: Arc<dyn PrincipalStore>) -> Self {
        self.principal_store = store;
        self
    }

    /// Register a handler module.
    pub fn register<M: RpcModule>(mut self, module: M) -> Self {
        self.registry.register(module);
        self
    }

    /// Assemble the router: login endpoints plus RPC dispatch.
    pub fn build(self) -> Router {
        let issuer = TokenIssuer::new(self.config.jwt_secret());
        let authenticator = Arc::new(JwtAuthenticator::new(
            issuer.clone(),
            Arc::clone(&self.principal_store),
        ));
        let codec = Codec::new(self.config.codec_limits());
        let state = RpcState::new(Arc::new(self.registry), authenticator, codec);
        login_router(AuthState::new(issuer, self.principal_store)).merge(rpc_router(state))
    }

    /// Build and serve on `addr` until shutdown.
    pub async fn serve(self, addr: &str) -> std::io::Result<()> {
        let router = self.build();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "poto server listening");
        axum::serve(listener, router).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn unknown_routes_fall_through_to_404() {
        let router = PotoServer::builder(PotoConfig::default()).build();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/nothing/here")
                    .method("POST")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["__error"]["name"], "NotFound");
    }

    #[test]
    fn both_backends_assemble() {
        let mut config = PotoConfig::default();
        assert!(session_store(&config).is_ok());
        config.session_backend = SessionBackendKind::Cookie;
        assert!(session_store(&config).is_ok());
    }
}
