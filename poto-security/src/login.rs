//! Login endpoints: visitor registration and password login.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use http::StatusCode;
use poto_core::principal::{Principal, PrincipalStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SecurityError;
use crate::password::{generate_password, hash_password, verify_password};
use crate::token::TokenIssuer;

const VISITOR_PASSWORD_LEN: usize = 24;
/// Retry bound for the visitor identifier collision loop. With UUIDv4
/// identifiers a second attempt is already unreachable in practice.
const VISITOR_CREATE_ATTEMPTS: usize = 8;

/// State for the login router.
#[derive(Clone)]
pub struct AuthState {
    issuer: TokenIssuer,
    store: Arc<dyn PrincipalStore>,
}

impl AuthState {
    pub fn new(issuer: TokenIssuer, store: Arc<dyn PrincipalStore>) -> Self {
        Self { issuer, store }
    }
}

/// Build the login router: `POST /login/visitor` and `POST /login`.
pub fn login_router(state: AuthState) -> Router {
    Router::new()
        .route("/login/visitor", post(visitor_login))
        .route("/login", post(login))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisitorLoginRequest {
    visitor_id: Option<String>,
    visitor_password: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitorLoginResponse {
    user_id: String,
    token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    user_id: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
}

async fn visitor_login(State(state): State<AuthState>, body: Bytes) -> Response {
    let request: Option<VisitorLoginRequest> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => Some(req),
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("Malformed login body: {e}"))
                    .into_response()
            }
        }
    };

    match request {
        Some(VisitorLoginRequest {
            visitor_id: Some(visitor_id),
            visitor_password: Some(visitor_password),
        }) => returning_visitor(&state, &visitor_id, &visitor_password).await,
        _ => fresh_visitor(&state).await,
    }
}

/// A returning visitor presents its identifier and password and receives
/// a fresh token.
async fn returning_visitor(state: &AuthState, visitor_id: &str, password: &str) -> Response {
    let Some(principal) = state.store.find_principal(visitor_id).await else {
        return SecurityError::UnknownPrincipal(visitor_id.to_string()).into_response();
    };
    let credentials_match = principal
        .credential_hash()
        .is_some_and(|hash| verify_password(password, hash));
    if !principal.is_visitor() || !credentials_match {
        return SecurityError::BadCredentials.into_response();
    }

    match state.issuer.issue(principal.id()) {
        Ok(token) => Json(VisitorLoginResponse {
            user_id: principal.id().to_string(),
            token,
            password: None,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Create and register a fresh visitor principal. The insert goes through
/// the capability interface's atomic `add_principal`, so concurrent
/// anonymous logins each end up with a distinct registered identifier.
async fn fresh_visitor(state: &AuthState) -> Response {
    for _ in 0..VISITOR_CREATE_ATTEMPTS {
        let visitor_id = format!("visitor_{}", Uuid::new_v4().simple());
        let password = generate_password(VISITOR_PASSWORD_LEN);
        let hash = match hash_password(&password) {
            Ok(hash) => hash,
            Err(e) => return e.into_response(),
        };

        if !state
            .store
            .add_principal(Principal::visitor(&visitor_id, hash))
            .await
        {
            continue;
        }

        info!(visitor = %visitor_id, "registered fresh visitor principal");
        return match state.issuer.issue(&visitor_id) {
            Ok(token) => Json(VisitorLoginResponse {
                user_id: visitor_id,
                token,
                password: Some(password),
            })
            .into_response(),
            Err(e) => e.into_response(),
        };
    }

    warn!("exhausted visitor identifier attempts");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Could not allocate a visitor identifier",
    )
        .into_response()
}

async fn login(State(state): State<AuthState>, body: Bytes) -> Response {
    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Malformed login body: {e}"))
                .into_response()
        }
    };

    let Some(principal) = state.store.find_principal(&request.user_id).await else {
        return SecurityError::UnknownPrincipal(request.user_id).into_response();
    };
    let credentials_match = principal
        .credential_hash()
        .is_some_and(|hash| verify_password(&request.password, hash));
    if !credentials_match {
        return SecurityError::BadCredentials.into_response();
    }

    match state.issuer.issue(principal.id()) {
        Ok(token) => Json(LoginResponse { token }).into_response(),
        Err(e) => e.into_response(),
    }
}
