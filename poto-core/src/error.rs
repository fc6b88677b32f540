use axum::response::{IntoResponse, Response};
use http::{header, HeaderValue, StatusCode};
use poto_codec::{Codec, CodecError, ErrorValue, Value};

use crate::context::ContextError;

/// Error surface of the dispatcher and of handler methods.
///
/// Every variant maps to exactly one HTTP status; the response body is the
/// error encoded through the typed codec, so clients decode failures with
/// the same machinery as results.
pub enum RpcError {
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
    Internal(String),
    /// A rich error raised by a handler, carried verbatim to the client.
    Handler(ErrorValue),
}

impl RpcError {
    /// Convenience constructor for handler-raised errors.
    pub fn handler(name: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Handler(ErrorValue::new(name, message))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RpcError::Forbidden(_) => StatusCode::FORBIDDEN,
            RpcError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RpcError::Internal(_) | RpcError::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The codec-level error value for the response body or `__error` frame.
    pub fn to_error_value(&self) -> ErrorValue {
        match self {
            RpcError::NotFound(msg) => ErrorValue::new("NotFound", msg.clone()),
            RpcError::Unauthorized(msg) => ErrorValue::new("Unauthorized", msg.clone()),
            RpcError::Forbidden(msg) => ErrorValue::new("Forbidden", msg.clone()),
            RpcError::BadRequest(msg) => ErrorValue::new("BadRequest", msg.clone()),
            RpcError::Internal(msg) => ErrorValue::new("InternalError", msg.clone()),
            RpcError::Handler(e) => e.clone(),
        }
    }

    /// The `{"__error": ...}` envelope as text, for bodies and SSE frames.
    pub fn to_envelope_text(&self) -> String {
        let value = Value::Error(Box::new(self.to_error_value()));
        Codec::default()
            .encode_to_string(&value)
            .unwrap_or_else(|_| {
                // Our own error values never exceed the default limits, but
                // a handler-raised cause graph might; fall back to the names.
                serde_json::json!({
                    "__error": { "name": "InternalError", "message": "error encoding failed" }
                })
                .to_string()
            })
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_envelope_text()).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            RpcError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            RpcError::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            RpcError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            RpcError::Internal(msg) => write!(f, "Internal Error: {msg}"),
            RpcError::Handler(e) => write!(f, "{}: {}", e.name, e.message),
        }
    }
}

impl std::fmt::Debug for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for RpcError {}

impl From<ContextError> for RpcError {
    fn from(err: ContextError) -> Self {
        RpcError::Internal(err.to_string())
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::Internal(format!("codec failure: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: RpcError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn statuses_and_envelopes() {
        let (status, body) = error_parts(RpcError::NotFound("no such handler".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["__error"]["name"], "NotFound");
        assert_eq!(body["__error"]["message"], "no such handler");

        let (status, _) = error_parts(RpcError::Unauthorized("token".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = error_parts(RpcError::Forbidden("roles".into())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = error_parts(RpcError::BadRequest("args".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = error_parts(RpcError::handler("AppError", "boom")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["__error"]["name"], "AppError");
    }
}
