//! In-process billing backend for integration tests.
//!
//! Serves the three project endpoints (`ws`, `events`, `snapshot`) and lets a
//! test push frames to every open socket and event stream.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Default)]
pub struct Counters {
    pub upgrades: AtomicUsize,
    pub open_sockets: AtomicUsize,
    pub sse_opens: AtomicUsize,
    pub snapshot_hits: AtomicUsize,
}

struct Inner {
    push: broadcast::Sender<String>,
    snapshot: Mutex<Value>,
    commands: Mutex<Vec<Value>>,
    counters: Counters,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    inner: Arc<Inner>,
}

impl MockBackend {
    /// Backend with every endpoint enabled.
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Backend without the socket route, so upgrades fail with 404.
    pub async fn without_websocket() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(websocket: bool) -> Self {
        let inner = Arc::new(Inner {
            push: broadcast::channel(64).0,
            snapshot: Mutex::new(json!({})),
            commands: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });

        let mut app = Router::new()
            .route("/api/projects/{project_id}/events", get(events_route))
            .route("/api/projects/{project_id}/snapshot", get(snapshot_route));
        if websocket {
            app = app.route("/api/projects/{project_id}/ws", get(ws_route));
        }
        let app = app.with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, inner }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Send one frame to every open socket and event stream.
    pub fn push(&self, frame: Value) {
        let _ = self.inner.push.send(frame.to_string());
    }

    pub fn set_snapshot(&self, view: Value) {
        *self.inner.snapshot.lock().unwrap() = view;
    }

    pub fn commands(&self) -> Vec<Value> {
        self.inner.commands.lock().unwrap().clone()
    }

    pub fn counters(&self) -> &Counters {
        &self.inner.counters
    }
}

/// Accepts TCP connections and never answers on them, so every handshake
/// hangs until the client gives up.
pub struct SilentListener {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
}

impl SilentListener {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        Self { addr, accepted }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn ws_route(
    State(inner): State<Arc<Inner>>,
    Path(project_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    inner.counters.upgrades.fetch_add(1, Ordering::SeqCst);
    // Subscribe before the handshake completes so no push is missed.
    let pushes = inner.push.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, project_id, pushes, inner))
}

async fn handle_socket(
    socket: WebSocket,
    project_id: String,
    mut pushes: broadcast::Receiver<String>,
    inner: Arc<Inner>,
) {
    inner.counters.open_sockets.fetch_add(1, Ordering::SeqCst);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            pushed = pushes.recv() => match pushed {
                Ok(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let cmd: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    let reply = match cmd["type"].as_str() {
                        Some("ping") => Some(json!({"type": "pong"})),
                        Some("request_snapshot") => Some(json!({
                            "event": "project_snapshot",
                            "project_id": project_id,
                            "data": inner.snapshot.lock().unwrap().clone(),
                        })),
                        _ => None,
                    };
                    inner.commands.lock().unwrap().push(cmd);
                    if let Some(reply) = reply {
                        if sender.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    inner.counters.open_sockets.fetch_sub(1, Ordering::SeqCst);
}

async fn events_route(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    inner.counters.sse_opens.fetch_add(1, Ordering::SeqCst);
    let pushes = inner.push.subscribe();
    let stream = futures_util::stream::unfold(pushes, |mut pushes| async move {
        loop {
            match pushes.recv().await {
                Ok(frame) => {
                    return Some((Ok::<_, Infallible>(format!("data: {frame}\n\n")), pushes))
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
}

async fn snapshot_route(State(inner): State<Arc<Inner>>) -> Json<Value> {
    inner.counters.snapshot_hits.fetch_add(1, Ordering::SeqCst);
    Json(inner.snapshot.lock().unwrap().clone())
}
