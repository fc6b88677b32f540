//! HTTP facade: the axum surface the sibling crates build on.

pub use axum::body::Body;
pub use axum::extract::{FromRequestParts, Path, Query, Request, State};
pub use axum::response::{IntoResponse, Response};
pub use axum::{routing, serve, Json, Router};

pub use http::header::{
    self, HeaderName, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE,
    COOKIE, SET_COOKIE,
};
pub use http::{HeaderMap, Method, StatusCode, Uri};
