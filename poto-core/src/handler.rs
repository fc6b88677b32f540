//! Handler registration: modules, routable methods, and the registry.
//!
//! Methods are named `<verb><Name>_`: the prefix selects the HTTP method
//! (POST when no prefix is recognized) and the trailing underscore marks
//! the symbol as routable. The client-visible path is
//! `/<handler-name>/<methodname-without-verb-lowercased>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use http::Method as HttpMethod;
use poto_codec::Value;
use tracing::debug;

use crate::error::RpcError;

/// A lazily produced sequence of values, framed as server-sent events.
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Value, RpcError>> + Send>>;

/// A raw byte stream, framed as an octet-stream body.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// What a handler method hands back to the dispatcher. The dispatcher
/// classifies this to pick the response framing.
pub enum RpcResponse {
    /// A single value, returned as one JSON body.
    Value(Value),
    /// A lazy sequence, streamed as `text/event-stream`.
    Stream(ValueStream),
    /// Raw bytes, streamed as `application/octet-stream` with backpressure.
    Bytes(ByteStream),
}

type MethodFuture = Pin<Box<dyn Future<Output = Result<RpcResponse, RpcError>> + Send>>;
type InvokeFn = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// A routable method on a handler module.
pub struct Method {
    raw_name: String,
    route: String,
    verb: HttpMethod,
    required_roles: Vec<String>,
    min_args: usize,
    invoke: InvokeFn,
}

impl Method {
    /// A method returning a single value.
    pub fn value<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self::build(name, Arc::new(move |args| {
            let fut = f(args);
            let boxed: MethodFuture = Box::pin(async move { fut.await.map(RpcResponse::Value) });
            boxed
        }))
    }

    /// A method returning a lazy sequence of values.
    pub fn streaming<F, Fut, S>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: Stream<Item = Result<Value, RpcError>> + Send + 'static,
    {
        Self::build(name, Arc::new(move |args| {
            let fut = f(args);
            let boxed: MethodFuture = Box::pin(async move {
                fut.await
                    .map(|stream| RpcResponse::Stream(Box::pin(stream)))
            });
            boxed
        }))
    }

    /// A method returning a raw byte stream.
    pub fn bytes<F, Fut, S>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self::build(name, Arc::new(move |args| {
            let fut = f(args);
            let boxed: MethodFuture = Box::pin(async move {
                fut.await
                    .map(|stream| RpcResponse::Bytes(Box::pin(stream)))
            });
            boxed
        }))
    }

    fn build(name: &str, invoke: InvokeFn) -> Self {
        let (verb, route) = parse_route_name(name);
        Self {
            raw_name: name.to_string(),
            route,
            verb,
            required_roles: Vec::new(),
            min_args: 0,
            invoke,
        }
    }

    /// Restrict the method to principals holding at least one of `roles`.
    pub fn require_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Reject calls carrying fewer than `n` positional arguments. Extra
    /// arguments are always tolerated.
    pub fn min_args(mut self, n: usize) -> Self {
        self.min_args = n;
        self
    }

    pub fn raw_name(&self) -> &str {
        &self.raw_name
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn verb(&self) -> &HttpMethod {
        &self.verb
    }

    pub fn required_roles(&self) -> &[String] {
        &self.required_roles
    }

    pub fn required_args(&self) -> usize {
        self.min_args
    }

    pub(crate) fn invoke(&self, args: Vec<Value>) -> MethodFuture {
        (self.invoke)(args)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("raw_name", &self.raw_name)
            .field("verb", &self.verb)
            .field("route", &self.route)
            .field("required_roles", &self.required_roles)
            .field("min_args", &self.min_args)
            .finish_non_exhaustive()
    }
}

/// Parse `<verb><Name>_` into the HTTP verb and the lowercased route
/// segment. Panics on a malformed name; registration runs at startup and a
/// bad name is a programming error, the same stance axum takes on routes.
fn parse_route_name(name: &str) -> (HttpMethod, String) {
    let Some(base) = name.strip_suffix('_') else {
        panic!("method name `{name}` must end with `_` to be routable");
    };
    if base.is_empty() {
        panic!("method name `{name}` has no route segment");
    }

    const VERBS: &[(&str, HttpMethod)] = &[
        ("get", HttpMethod::GET),
        ("post", HttpMethod::POST),
        ("put", HttpMethod::PUT),
        ("delete", HttpMethod::DELETE),
        ("patch", HttpMethod::PATCH),
    ];

    for (prefix, verb) in VERBS {
        if let Some(rest) = base.strip_prefix(prefix) {
            // The prefix only counts when followed by a capitalized name:
            // `getUser_` routes as GET /user, `getaway_` as POST /getaway.
            if rest.chars().next().is_some_and(|c| c.is_uppercase()) {
                return (verb.clone(), rest.to_lowercase());
            }
        }
    }
    (HttpMethod::POST, base.to_lowercase())
}

/// A class-like object exposing routable methods. One instance is shared
/// across all requests; implementations must treat instance state as
/// immutable configuration and keep per-request state in the request
/// context and the session store.
pub trait RpcModule: Send + Sync + 'static {
    /// The handler name; the path segment is its lowercased form.
    fn name(&self) -> &'static str;

    /// The routable methods. Invoke closures capture `Arc<Self>`.
    fn methods(self: &Arc<Self>) -> Vec<Method>;
}

pub(crate) struct RegisteredHandler {
    name: String,
    methods: HashMap<(HttpMethod, String), Method>,
}

impl RegisteredHandler {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn method(&self, verb: &HttpMethod, route: &str) -> Option<&Method> {
        self.methods.get(&(verb.clone(), route.to_string()))
    }
}

/// The append-only handler registration table. Populated during startup,
/// read-only thereafter.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Panics on duplicate handler or method routes.
    pub fn register<M: RpcModule>(&mut self, module: M) {
        let module = Arc::new(module);
        let name = module.name().to_string();
        let key = name.to_lowercase();
        if self.handlers.contains_key(&key) {
            panic!("handler `{name}` is already registered");
        }

        let mut methods = HashMap::new();
        for method in module.methods() {
            debug!(
                handler = %name,
                method = %method.raw_name(),
                verb = %method.verb(),
                route = %method.route(),
                "registering rpc method"
            );
            let route_key = (method.verb().clone(), method.route().to_string());
            if methods.insert(route_key, method).is_some() {
                panic!("handler `{name}` registers a duplicate route");
            }
        }

        self.handlers.insert(key, RegisteredHandler { name, methods });
    }

    pub(crate) fn get(&self, handler_route: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(handler_route)
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.values().map(|h| h.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_names_parse_verbs() {
        let cases = [
            ("postIncrement_", HttpMethod::POST, "increment"),
            ("getUser_", HttpMethod::GET, "user"),
            ("putProfile_", HttpMethod::PUT, "profile"),
            ("deleteAccount_", HttpMethod::DELETE, "account"),
            ("patchSettings_", HttpMethod::PATCH, "settings"),
            // No recognized prefix: defaults to POST on the whole name.
            ("increment_", HttpMethod::POST, "increment"),
            ("getaway_", HttpMethod::POST, "getaway"),
        ];
        for (name, verb, route) in cases {
            let (v, r) = parse_route_name(name);
            assert_eq!(v, verb, "{name}");
            assert_eq!(r, route, "{name}");
        }
    }

    #[test]
    #[should_panic(expected = "must end with `_`")]
    fn non_routable_names_are_rejected() {
        parse_route_name("helper");
    }

    struct Demo;

    impl RpcModule for Demo {
        fn name(&self) -> &'static str {
            "Demo"
        }

        fn methods(self: &Arc<Self>) -> Vec<Method> {
            vec![
                Method::value("postEcho_", |mut args| async move {
                    Ok(args.pop().unwrap_or(Value::Null))
                })
                .min_args(1),
                Method::value("getStatus_", |_| async move { Ok(Value::string("ok")) }),
            ]
        }
    }

    #[test]
    fn registry_indexes_by_lowercased_names() {
        let mut registry = HandlerRegistry::new();
        registry.register(Demo);
        let handler = registry.get("demo").expect("registered");
        assert_eq!(handler.name(), "Demo");
        assert!(handler.method(&HttpMethod::POST, "echo").is_some());
        assert!(handler.method(&HttpMethod::GET, "status").is_some());
        assert!(handler.method(&HttpMethod::GET, "echo").is_none());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_handlers_panic() {
        let mut registry = HandlerRegistry::new();
        registry.register(Demo);
        registry.register(Demo);
    }
}
