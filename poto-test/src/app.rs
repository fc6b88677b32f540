use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

/// In-process HTTP test client wrapping an axum `Router`.
///
/// Uses `tower::ServiceExt::oneshot` to dispatch requests without binding
/// to a TCP port.
pub struct TestApp {
    router: Router,
}

impl TestApp {
    /// Create a `TestApp` from an assembled router.
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Send an arbitrary request and collect the full response body.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.send_raw(request).await;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Send a request and hand back the raw streaming response. Use this
    /// when a test needs to read a few body frames and then drop the
    /// stream to simulate client disconnect.
    pub async fn send_raw(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("failed to send request")
    }

    fn request(
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<String>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json))
                .expect("invalid test request"),
            None => builder.body(Body::empty()).expect("invalid test request"),
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Self::request(Method::GET, path, None, None)).await
    }

    pub async fn get_authenticated(&self, path: &str, token: &str) -> TestResponse {
        self.send(Self::request(Method::GET, path, Some(token), None))
            .await
    }

    pub async fn post_json(&self, path: &str, body: &impl serde::Serialize) -> TestResponse {
        let json = serde_json::to_string(body).expect("unserializable test body");
        self.send(Self::request(Method::POST, path, None, Some(json)))
            .await
    }

    pub async fn post_json_authenticated(
        &self,
        path: &str,
        body: &impl serde::Serialize,
        token: &str,
    ) -> TestResponse {
        let json = serde_json::to_string(body).expect("unserializable test body");
        self.send(Self::request(Method::POST, path, Some(token), Some(json)))
            .await
    }

    /// POST with a raw (pre-encoded) body.
    pub async fn post_raw_authenticated(
        &self,
        path: &str,
        body: String,
        token: &str,
    ) -> TestResponse {
        self.send(Self::request(Method::POST, path, Some(token), Some(body)))
            .await
    }

    /// POST returning the raw streaming response.
    pub async fn post_stream_authenticated(
        &self,
        path: &str,
        body: &impl serde::Serialize,
        token: &str,
    ) -> Response<Body> {
        let json = serde_json::to_string(body).expect("unserializable test body");
        self.send_raw(Self::request(Method::POST, path, Some(token), Some(json)))
            .await
    }
}

/// A fully collected response.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Parse the body as server-sent-event frames.
    pub fn sse_frames(&self) -> Vec<crate::SseFrame> {
        crate::parse_sse_frames(&self.text())
    }
}
