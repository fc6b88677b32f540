//! The dispatcher-facing authenticator: bearer JWT → principal.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use poto_core::auth::{bearer_token, Authenticator};
use poto_core::principal::{Principal, PrincipalStore};
use tracing::debug;

use crate::token::TokenIssuer;

/// Verifies the `Authorization: Bearer <jwt>` header and resolves the
/// principal through the capability interface. Absent or invalid
/// credentials leave the request unauthenticated rather than failing it;
/// protected methods reject it downstream.
pub struct JwtAuthenticator {
    issuer: TokenIssuer,
    store: Arc<dyn PrincipalStore>,
}

impl JwtAuthenticator {
    pub fn new(issuer: TokenIssuer, store: Arc<dyn PrincipalStore>) -> Self {
        Self { issuer, store }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Arc<Principal>> {
        let token = bearer_token(headers)?;
        let claims = match self.issuer.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "bearer token rejected");
                return None;
            }
        };
        match self.store.find_principal(&claims.user_id).await {
            Some(principal) => Some(Arc::new(principal)),
            None => {
                debug!(user_id = %claims.user_id, "token names an unknown principal");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::AUTHORIZATION;
    use http::HeaderValue;
    use poto_core::principal::MemoryPrincipalStore;

    fn headers_with_token(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn valid_tokens_resolve_their_principal() {
        let store = Arc::new(MemoryPrincipalStore::new());
        store.add_principal(Principal::new("user-1", ["user"])).await;
        let issuer = TokenIssuer::new("secret");
        let auth = JwtAuthenticator::new(issuer.clone(), store);

        let token = issuer.issue("user-1").unwrap();
        let principal = auth.authenticate(&headers_with_token(&token)).await.unwrap();
        assert_eq!(principal.id(), "user-1");
    }

    #[tokio::test]
    async fn invalid_tokens_leave_the_request_unauthenticated() {
        let store = Arc::new(MemoryPrincipalStore::new());
        let auth = JwtAuthenticator::new(TokenIssuer::new("secret"), store.clone());

        assert!(auth.authenticate(&HeaderMap::new()).await.is_none());
        assert!(auth
            .authenticate(&headers_with_token("garbage"))
            .await
            .is_none());

        // A valid signature naming an unknown principal also fails closed.
        let issuer = TokenIssuer::new("secret");
        let token = issuer.issue("ghost").unwrap();
        assert!(auth.authenticate(&headers_with_token(&token)).await.is_none());
    }
}
