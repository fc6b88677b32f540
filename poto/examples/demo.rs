//! A small Poto server: `cargo run --example demo`, then
//!
//! ```sh
//! TOKEN=$(curl -s -X POST localhost:3000/login/visitor | jq -r .token)
//! curl -s -X POST localhost:3000/counter/increment \
//!     -H "Authorization: Bearer $TOKEN" -d '[41]'
//! curl -N -s -X POST localhost:3000/ticker/tick \
//!     -H "Authorization: Bearer $TOKEN" -d '[3]'
//! ```

use std::sync::Arc;
use std::time::Duration;

use poto::{Method, PotoConfig, PotoServer, RpcError, RpcModule, SessionStore, Value};

struct Counter {
    sessions: SessionStore,
}

impl RpcModule for Counter {
    fn name(&self) -> &'static str {
        "Counter"
    }

    fn methods(self: &Arc<Self>) -> Vec<Method> {
        let this = Arc::clone(self);
        vec![
            Method::value("postIncrement_", |args| async move {
                let n = args
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| RpcError::BadRequest("expected a number".into()))?;
                Ok(Value::Number(n + 1.0))
            })
            .min_args(1),
            // A per-visitor counter kept in the session store.
            Method::value("postBump_", move |_| {
                let this = Arc::clone(&this);
                async move {
                    let count = this
                        .sessions
                        .get_value("count")
                        .await?
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    this.sessions
                        .set_value("count", Value::Number(count + 1.0))
                        .await?;
                    Ok(Value::Number(count + 1.0))
                }
            }),
        ]
    }
}

struct Ticker;

impl RpcModule for Ticker {
    fn name(&self) -> &'static str {
        "Ticker"
    }

    fn methods(self: &Arc<Self>) -> Vec<Method> {
        vec![Method::streaming("postTick_", |args| async move {
            let count = args.first().and_then(Value::as_f64).unwrap_or(5.0) as i64;
            Ok(futures_stream(count))
        })
        .min_args(1)]
    }
}

fn futures_stream(
    count: i64,
) -> impl futures_core::Stream<Item = Result<Value, RpcError>> + Send {
    futures_util::stream::unfold(0, move |i| async move {
        if i >= count {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        Some((Ok(Value::object([("i", Value::int(i))])), i + 1))
    })
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    poto::init_tracing();

    let config = PotoConfig::default();
    let sessions = poto::session_store(&config).expect("session store");

    PotoServer::builder(config)
        .register(Counter { sessions })
        .register(Ticker)
        .serve("0.0.0.0:3000")
        .await
}
