//! Scriptable in-process stand-in for the Flagsmith api and its SSE endpoint.
#![allow(dead_code)]
use bytes::Bytes;
use flagsmith::config::{FlagsmithConfig, FlagsmithConfigBuilder};
use futures_util::stream;
use http_body_util::{BodyExt, Full, StreamBody, combinators::UnsyncBoxBody};
use hyper::{
    Method, Request, Response, StatusCode, body::Frame, body::Incoming,
    server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

pub const ENVIRONMENT_KEY: &str = "ser.test";

type RespBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Default)]
struct MockState {
    flags: Value,
    identity_flags: Value,
    identity_traits: Value,
    updated_at: Option<f64>,
    failing: bool,
    etag: Option<String>,
    requests: Vec<RecordedRequest>,
    sse_clients: Vec<mpsc::UnboundedSender<Bytes>>,
    sse_connects: usize,
}

pub struct MockFlagsmith {
    pub addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    server: JoinHandle<()>,
}

impl Drop for MockFlagsmith {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn flag(id: i64, name: &str, enabled: bool, value: Value) -> Value {
    json!({
        "feature": {"id": id, "name": name, "type": "STANDARD"},
        "feature_state_value": value,
        "enabled": enabled,
    })
}

impl MockFlagsmith {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState {
            flags: json!([]),
            identity_flags: json!([]),
            identity_traits: json!([]),
            ..Default::default()
        }));

        let server_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&server_state);
                let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                tokio::spawn(async move {
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api/v1/", self.addr)
    }

    pub fn event_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Analytics and realtime off, cache off, short timeouts.
    pub fn config(&self) -> FlagsmithConfig {
        FlagsmithConfigBuilder::default()
            .environment_key(ENVIRONMENT_KEY)
            .base_url(self.api_url())
            .event_source_base_url(self.event_url())
            .enable_analytics(false)
            .request_timeout_secs(2_u64)
            .build()
            .unwrap()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_flags(&self, flags: Value) {
        self.with_state(|s| s.flags = flags);
    }

    pub fn set_identity(&self, flags: Value, traits: Value) {
        self.with_state(|s| {
            s.identity_flags = flags;
            s.identity_traits = traits;
        });
    }

    pub fn set_updated_at(&self, updated_at: Option<f64>) {
        self.with_state(|s| s.updated_at = updated_at);
    }

    pub fn set_failing(&self, failing: bool) {
        self.with_state(|s| s.failing = failing);
    }

    pub fn set_etag(&self, etag: Option<&str>) {
        self.with_state(|s| s.etag = etag.map(str::to_string));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.with_state(|s| s.requests.clone())
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    pub fn flag_requests(&self) -> usize {
        self.requests_to(Method::GET, "/api/v1/flags/").len()
    }

    pub fn sse_connects(&self) -> usize {
        self.with_state(|s| s.sse_connects)
    }

    /// Send raw SSE text to every open stream.
    pub fn push_raw(&self, text: &str) {
        self.with_state(|s| {
            s.sse_clients
                .retain(|tx| tx.send(Bytes::from(text.to_string())).is_ok())
        });
    }

    pub fn push_update(&self, updated_at: f64) {
        self.push_raw(&format!(
            "event: environment_updated\ndata: {{\"updated_at\": {updated_at}}}\n\n"
        ));
    }

    /// End every open stream.
    pub fn disconnect_streams(&self) {
        self.with_state(|s| s.sse_clients.clear());
    }
}

fn full(status: StatusCode, body: impl Into<Bytes>) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).boxed_unsync())
        .unwrap()
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<Mutex<MockState>>,
) -> Result<Response<RespBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = req.into_body().collect().await.unwrap().to_bytes();
    let recorded = RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query,
        headers,
        body,
    };

    let mut state = state.lock().unwrap();
    state.requests.push(recorded.clone());

    if path.starts_with("/sse/environments/") {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        state.sse_clients.push(tx);
        state.sse_connects += 1;
        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
        });
        return Ok(Response::builder()
            .header("content-type", "text/event-stream")
            .body(StreamBody::new(frames).boxed_unsync())
            .unwrap());
    }

    if state.failing && path.starts_with("/api/v1/") {
        return Ok(full(StatusCode::INTERNAL_SERVER_ERROR, "boom"));
    }

    let mut response = match (&method, path.as_str()) {
        (&Method::GET, "/api/v1/flags/") => {
            if let (Some(etag), Some(sent)) = (&state.etag, recorded.header("if-none-match")) {
                if etag == sent {
                    let mut response = full(StatusCode::NOT_MODIFIED, Bytes::new());
                    response
                        .headers_mut()
                        .insert("etag", etag.parse().unwrap());
                    return Ok(response);
                }
            }
            full(StatusCode::OK, state.flags.to_string())
        }
        (&Method::GET, "/api/v1/identities/") => full(
            StatusCode::OK,
            json!({"flags": state.identity_flags, "traits": state.identity_traits}).to_string(),
        ),
        (&Method::POST, "/api/v1/identities/") => {
            let sent = recorded.json();
            full(
                StatusCode::OK,
                json!({"flags": state.identity_flags, "traits": sent["traits"]}).to_string(),
            )
        }
        (&Method::POST, "/api/v1/analytics/flags/") => full(StatusCode::OK, "{}"),
        _ => full(StatusCode::NOT_FOUND, "not found"),
    };

    if let Some(updated_at) = state.updated_at {
        response.headers_mut().insert(
            "x-flagsmith-document-updated-at",
            updated_at.to_string().parse().unwrap(),
        );
    }
    if let Some(etag) = &state.etag {
        response.headers_mut().insert("etag", etag.parse().unwrap());
    }
    Ok(response)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
