//! Test doubles: a loopback HTTP server standing in for llama-server and
//! download hosts, a shell-backed [`ServerCommand`], and event helpers.
//!
//! Compiled for this crate's tests and, with the `testing` feature, for
//! dependent crates.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body as HttpBody;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::StartError;
use crate::events::RuntimeEvent;
use crate::server::{ServerCommand, ServerLaunch};

/// How long event helpers wait before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
enum Body {
    Bytes(Vec<u8>),
    Events(Vec<String>),
}

/// Canned response for one route.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    content_type: String,
    body: Body,
    chunk_size: usize,
    delay: Duration,
    honor_range: bool,
    hold_open: bool,
    send_done: bool,
}

impl MockResponse {
    fn new(status: u16, content_type: &str, body: Body) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body,
            chunk_size: usize::MAX,
            delay: Duration::ZERO,
            honor_range: false,
            hold_open: false,
            send_done: true,
        }
    }

    /// Empty body with the given status.
    pub fn status(status: u16) -> Self {
        Self::new(status, "text/plain", Body::Bytes(Vec::new()))
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status, "text/plain", Body::Bytes(body.as_bytes().to_vec()))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(200, "application/json", Body::Bytes(value.to_string().into_bytes()))
    }

    /// Binary download honoring `Range: bytes=N-`.
    pub fn file(data: Vec<u8>) -> Self {
        let mut response = Self::new(200, "application/octet-stream", Body::Bytes(data));
        response.honor_range = true;
        response
    }

    /// Event stream of `data:` payloads followed by `[DONE]`.
    pub fn sse(payloads: Vec<String>) -> Self {
        Self::new(200, "text/event-stream", Body::Events(payloads))
    }

    /// Write a byte body in pieces of `chunk_size` bytes.
    pub fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Pause before each piece or event.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Ignore `Range` and always send the full body.
    pub fn without_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Keep an event stream open after the last payload instead of ending it.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Close an event stream after the last payload without sending `[DONE]`.
    pub fn without_done(mut self) -> Self {
        self.send_done = false;
        self
    }
}

/// A request the server received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct MockState {
    routes: Mutex<HashMap<(String, String), MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Loopback axum server with routes that can be replaced while it runs.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let state = Arc::new(MockState::default());

        // Every request goes through one handler so routes can change after start.
        let app = Router::new().fallback(respond).with_state(state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!("Mock server stopped: {}", e);
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Register (or replace) the response for `method path`.
    pub fn route(&self, method: &str, path: &str, response: MockResponse) {
        self.state
            .routes
            .lock()
            .expect("routes lock")
            .insert((method.to_string(), path.to_string()), response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RecordedRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: body.to_vec(),
    };
    let response = state
        .routes
        .lock()
        .expect("routes lock")
        .get(&(request.method.clone(), request.path.clone()))
        .cloned();
    state
        .requests
        .lock()
        .expect("requests lock")
        .push(request.clone());

    let Some(response) = response else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match &response.body {
        Body::Bytes(data) => bytes_response(&request, &response, data),
        Body::Events(payloads) => events_response(&response, payloads),
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn content_type(response: &MockResponse) -> HeaderValue {
    HeaderValue::from_str(&response.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

fn bytes_response(request: &RecordedRequest, response: &MockResponse, data: &[u8]) -> Response {
    let start = if response.honor_range {
        request.header("range").and_then(parse_range_start)
    } else {
        None
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type(response));
    let (status, body) = match start {
        Some(start) if start < data.len() => {
            let range = format!("bytes {}-{}/{}", start, data.len() - 1, data.len());
            if let Ok(value) = HeaderValue::from_str(&range) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::PARTIAL_CONTENT, data[start..].to_vec())
        }
        Some(_) => (StatusCode::RANGE_NOT_SATISFIABLE, Vec::new()),
        None => (status_code(response.status), data.to_vec()),
    };

    if response.chunk_size >= body.len() && response.delay.is_zero() {
        return (status, headers, body).into_response();
    }

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    let delay = response.delay;
    let pieces: Vec<Bytes> = body
        .chunks(response.chunk_size)
        .map(Bytes::copy_from_slice)
        .collect();
    let pieces = stream::iter(pieces).then(move |piece| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(piece)
    });
    (status, headers, HttpBody::from_stream(pieces)).into_response()
}

fn events_response(response: &MockResponse, payloads: &[String]) -> Response {
    let delay = response.delay;
    let events: Vec<Bytes> = payloads
        .iter()
        .map(|payload| Bytes::from(format!("data: {}\n\n", payload)))
        .collect();
    let mut body: BoxStream<'static, Result<Bytes, Infallible>> = stream::iter(events)
        .then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, Infallible>(event)
        })
        .boxed();

    if response.hold_open {
        body = body.chain(stream::pending()).boxed();
    } else if response.send_done {
        body = body
            .chain(stream::once(async {
                Ok(Bytes::from_static(b"data: [DONE]\n\n"))
            }))
            .boxed();
    }

    (
        status_code(response.status),
        [(header::CONTENT_TYPE, content_type(response))],
        HttpBody::from_stream(body),
    )
        .into_response()
}

fn parse_range_start(value: &str) -> Option<usize> {
    value
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Streamed chat chunk carrying `content`.
pub fn sse_content(content: &str) -> String {
    serde_json::json!({
        "choices": [{ "index": 0, "delta": { "content": content } }]
    })
    .to_string()
}

/// Runs `sh -c <script>` in place of llama-server.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    script: String,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl ServerCommand for ShellCommand {
    fn build(&self, _launch: &ServerLaunch, _port: u16) -> Result<Command, StartError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.script);
        Ok(command)
    }
}

/// Receive events until `matches` accepts one, returning all received.
///
/// Panics after [`EVENT_TIMEOUT`].
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<RuntimeEvent>, mut matches: F) -> Vec<RuntimeEvent>
where
    F: FnMut(&RuntimeEvent) -> bool,
{
    let mut seen = Vec::new();
    let found = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = matches(&event);
                    seen.push(event);
                    if done {
                        return true;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;

    match found {
        Ok(true) => seen,
        _ => panic!(
            "event not observed; saw {:?}",
            seen.iter().map(RuntimeEvent::name).collect::<Vec<_>>()
        ),
    }
}

/// Everything already queued on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
