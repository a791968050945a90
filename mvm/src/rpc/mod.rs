//! The read-only status endpoint.
//!
//! A single JSON call endpoint at `POST /`. Requests are `{"id", "method", "params"}`, and no method takes params.
//! Every response is HTTP 200 with a JSON object holding either `data` or `error`, plus the request's `id` if it had a
//! non-empty one.

mod info;

use std::{
    net::{Ipv4Addr, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, anyhow};
use axum::{
    Router,
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
};
use http::{
    HeaderName, Method, Uri,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
pub use info::{Info, ProcessInfo, get_info};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{debug, info};

use crate::machine::Store;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CORS_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct Call {
    #[serde(default)]
    id: String,
    #[serde(default)]
    method: String,
}

pub fn make_router(store: Arc<dyn Store>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(store)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors())
}

/// Browsers may call from any origin which identifies itself. Preflight requests are answered by the layer.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("mixin-conversation-id"),
        ])
        .allow_methods([Method::OPTIONS, Method::GET, Method::POST, Method::DELETE])
        .max_age(CORS_MAX_AGE)
}

/// Serves the status endpoint on `port` until `cancel` fires.
pub async fn serve(store: Arc<dyn Store>, port: u16, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
    info!(addr = %listener.local_addr()?, "status endpoint listening");
    axum::serve(listener, make_router(store))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn handle(
    State(store): State<Arc<dyn Store>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    if method != Method::POST || uri.path() != "/" {
        return error(None, format!("bad request {method} {}", uri.path()));
    }

    let call: Call = match serde_json::from_slice(&body) {
        Ok(call) => call,
        Err(e) => return error(None, format!("bad request {e}")),
    };
    debug!(method = %call.method, id = %call.id, "status call");

    let id = Some(call.id.as_str()).filter(|id| !id.is_empty());
    match panic::catch_unwind(AssertUnwindSafe(|| dispatch(store.as_ref(), &call))) {
        Ok(Ok(data)) => respond(id, "data", data),
        Ok(Err(e)) => error(id, e.to_string()),
        Err(_) => error(None, "bad request".to_owned()),
    }
}

fn dispatch(store: &dyn Store, call: &Call) -> Result<Value> {
    match call.method.as_str() {
        "getinfo" => Ok(serde_json::to_value(get_info(store)?)?),
        method => Err(anyhow!("invalid method {method}")),
    }
}

fn error(id: Option<&str>, message: String) -> Response {
    respond(id, "error", Value::String(message))
}

fn respond(id: Option<&str>, key: &str, value: Value) -> Response {
    let mut body = Map::new();
    body.insert(key.to_owned(), value);
    if let Some(id) = id {
        body.insert("id".to_owned(), json!(id));
    }
    render(Value::Object(body))
}

fn render(body: Value) -> Response {
    ([(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}
