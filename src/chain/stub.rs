//! Scripted JSON-RPC node on a loopback port for exercising the HTTP gateway

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the node answers for one call
pub enum StubReply {
    Result(Value),
    Error { code: i64, message: &'static str },
    /// Body sent verbatim, bypassing the JSON-RPC envelope
    Raw(&'static str),
    /// Hold the request well past any client timeout
    Stall,
}

type Responder = dyn Fn(&str, u32) -> StubReply + Send + Sync;

#[derive(Clone)]
struct StubState {
    calls: Arc<DashMap<String, u32>>,
    responder: Arc<Responder>,
}

pub struct StubNode {
    pub url: String,
    calls: Arc<DashMap<String, u32>>,
    handle: JoinHandle<()>,
}

impl StubNode {
    /// Serve on an ephemeral port. `responder` gets the method name and the
    /// 1-based call count for that method.
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&str, u32) -> StubReply + Send + Sync + 'static,
    {
        let calls = Arc::new(DashMap::new());
        let state = StubState {
            calls: calls.clone(),
            responder: Arc::new(responder),
        };
        let app = Router::new().route("/", post(handle)).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { url, calls, handle }
    }

    pub fn calls(&self, method: &str) -> u32 {
        self.calls.get(method).map(|count| *count).unwrap_or(0)
    }
}

impl Drop for StubNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle(State(state): State<StubState>, body: String) -> Response {
    let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default().to_string();

    let call = {
        let mut count = state.calls.entry(method.clone()).or_insert(0);
        *count += 1;
        *count
    };

    match (state.responder)(&method, call) {
        StubReply::Result(result) => {
            Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response()
        }
        StubReply::Error { code, message } => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }))
        .into_response(),
        StubReply::Raw(text) => text.into_response(),
        StubReply::Stall => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null })).into_response()
        }
    }
}
