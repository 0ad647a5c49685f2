//! Live channel to the billing backend, with state tracking and reconnect.
//!
//! A session is one project's channel: a push transport (WebSocket, SSE or
//! none) and, depending on the [`TransportMode`], a snapshot poller running
//! underneath it. Transports never touch the store themselves; they push
//! raw frames and fetched snapshots onto the provider's inbound queue,
//! tagged with their session generation so that anything arriving after a
//! disconnect or project switch is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use billsync_shared::{ClientCommand, ProjectId, ProjectView};
use futures_channel::mpsc::UnboundedSender;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api_client::{ApiClient, SnapshotSource};
use crate::config::{SyncConfig, TransportMode};
use crate::error::{Result, SyncError};

mod polling;
mod sse;
mod websocket;

/// Connection state for the provider's current project
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Push transports gave up. Polling (if enabled) keeps the data fresh.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Reconnecting { .. })
    }

    pub fn has_error(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        (delay as u32).min(self.max_delay_ms)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Handle for sending commands over the current project's open socket
#[derive(Clone)]
pub struct SocketHandle {
    sender: UnboundedSender<ClientCommand>,
    pub project_id: ProjectId,
}

impl SocketHandle {
    /// Send a command to the server
    pub fn send(&self, cmd: ClientCommand) -> Result<()> {
        crate::log_debug!("SocketHandle::send for project '{}': {:?}", self.project_id, cmd);
        self.sender
            .unbounded_send(cmd)
            .map_err(|_| SyncError::Closed)
    }

    /// Ask the server to push a fresh `project_snapshot`
    pub fn request_snapshot(&self) -> Result<()> {
        self.send(ClientCommand::RequestSnapshot {
            project_id: self.project_id.clone(),
        })
    }
}

/// Something a transport produced for the reducer.
#[derive(Debug)]
pub(crate) struct Inbound {
    /// Session that produced it; `None` for one-shot manual refreshes.
    pub generation: Option<u64>,
    pub payload: InboundPayload,
}

#[derive(Debug)]
pub(crate) enum InboundPayload {
    /// Undecoded text frame from a socket or event stream.
    Frame(String),
    /// Full view fetched over REST.
    Snapshot {
        project_id: ProjectId,
        view: ProjectView,
    },
}

#[derive(Debug)]
struct ActiveSession {
    project_id: ProjectId,
    generation: u64,
    cancel: CancellationToken,
    socket: Option<UnboundedSender<ClientCommand>>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_generation: u64,
    current: Option<ActiveSession>,
}

/// Tracks the single live session and publishes its connection state.
///
/// State writes and socket registration are keyed by generation, so a
/// session that has been torn down cannot overwrite its successor.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    state: watch::Sender<ConnectionState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            state: watch::channel(ConnectionState::Disconnected).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `project_id` the current project. Returns `None` when it already
    /// is; otherwise cancels any previous session first.
    pub fn begin(
        &self,
        project_id: &ProjectId,
        parent: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        let mut inner = self.lock();
        if let Some(active) = &inner.current {
            if &active.project_id == project_id {
                return None;
            }
            crate::log_info!(
                "switching project channel from {} to {}",
                active.project_id,
                project_id
            );
            active.cancel.cancel();
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let cancel = parent.child_token();
        inner.current = Some(ActiveSession {
            project_id: project_id.clone(),
            generation,
            cancel: cancel.clone(),
            socket: None,
        });
        self.state.send_replace(ConnectionState::Connecting);
        Some((generation, cancel))
    }

    /// Tear down the current session, if any.
    pub fn end(&self) -> Option<ProjectId> {
        let mut inner = self.lock();
        let active = inner.current.take()?;
        active.cancel.cancel();
        self.state.send_replace(ConnectionState::Disconnected);
        Some(active.project_id)
    }

    pub fn current_project(&self) -> Option<ProjectId> {
        self.lock().current.as_ref().map(|a| a.project_id.clone())
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    /// Run `f` with the session's project while `generation` is guaranteed
    /// to stay current.
    pub fn with_current<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&ProjectId) -> T,
    ) -> Option<T> {
        let inner = self.lock();
        match &inner.current {
            Some(active) if active.generation == generation => Some(f(&active.project_id)),
            _ => None,
        }
    }

    pub fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let inner = self.lock();
        match &inner.current {
            Some(active) if active.generation == generation => {
                self.state.send_if_modified(|current| {
                    if *current == state {
                        false
                    } else {
                        *current = state;
                        true
                    }
                });
                true
            }
            _ => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn attach_socket(&self, generation: u64, sender: UnboundedSender<ClientCommand>) {
        if let Some(active) = self.lock().current.as_mut() {
            if active.generation == generation {
                active.socket = Some(sender);
            }
        }
    }

    pub fn detach_socket(&self, generation: u64) {
        if let Some(active) = self.lock().current.as_mut() {
            if active.generation == generation {
                active.socket = None;
            }
        }
    }

    /// Handle to the open socket of `project_id`, if it is current and open.
    pub fn socket_for(&self, project_id: &ProjectId) -> Option<SocketHandle> {
        let inner = self.lock();
        let active = inner.current.as_ref()?;
        if &active.project_id != project_id {
            return None;
        }
        let sender = active.socket.clone()?;
        Some(SocketHandle {
            sender,
            project_id: active.project_id.clone(),
        })
    }
}

/// How a push transport stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Cancelled,
    /// Reconnect attempts used up; state is `Failed`.
    Exhausted,
}

enum Backoff {
    Retry,
    Exhausted,
    Cancelled,
}

/// Everything one session's transports need.
pub(crate) struct Session {
    pub generation: u64,
    pub project_id: ProjectId,
    pub config: Arc<SyncConfig>,
    pub api: ApiClient,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub registry: Arc<SessionRegistry>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn set_state(&self, state: ConnectionState) {
        self.registry.set_state(self.generation, state);
    }

    pub fn push_frame(&self, text: String) {
        let _ = self.inbound.send(Inbound {
            generation: Some(self.generation),
            payload: InboundPayload::Frame(text),
        });
    }

    pub fn push_snapshot(&self, view: ProjectView) {
        let _ = self.inbound.send(Inbound {
            generation: Some(self.generation),
            payload: InboundPayload::Snapshot {
                project_id: self.project_id.clone(),
                view,
            },
        });
    }

    /// Wait out the backoff delay for `attempt`, bumping it. Marks the
    /// session `Failed` once the attempt budget is spent.
    async fn backoff(&self, attempt: &mut u32, transport: &str) -> Backoff {
        let reconnect = &self.config.reconnect;
        if reconnect.exhausted(*attempt) {
            let reason = format!(
                "{transport}: max reconnect attempts ({}) exceeded",
                reconnect.max_attempts
            );
            crate::log_error!("{} for project {}", reason, self.project_id);
            self.set_state(ConnectionState::Failed { reason });
            return Backoff::Exhausted;
        }

        let delay = reconnect.delay_for_attempt(*attempt);
        *attempt += 1;
        crate::log_info!(
            "Reconnecting {} for {} in {}ms (attempt {})",
            transport,
            self.project_id,
            delay,
            attempt
        );
        self.set_state(ConnectionState::Reconnecting { attempt: *attempt });

        tokio::select! {
            _ = self.cancel.cancelled() => Backoff::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(u64::from(delay))) => Backoff::Retry,
        }
    }
}

/// Drive one project's channel until the session is cancelled.
pub(crate) async fn run_session(session: Session) {
    let mode = session.config.transport;
    crate::log_info!(
        "opening {:?} channel for project {} (generation {})",
        mode,
        session.project_id,
        session.generation
    );

    let push = async {
        match mode {
            TransportMode::Auto => {
                if websocket::run(&session).await == PushOutcome::Exhausted {
                    crate::log_warn!(
                        "WebSocket unavailable for {}, falling back to server-sent events",
                        session.project_id
                    );
                    sse::run(&session).await;
                }
            }
            TransportMode::WebSocket => {
                websocket::run(&session).await;
            }
            TransportMode::Sse => {
                sse::run(&session).await;
            }
            TransportMode::Polling => {}
        }
    };

    let poll = async {
        if mode.polls() {
            polling::run(&session, mode == TransportMode::Polling).await;
        }
    };

    tokio::join!(push, poll);
    crate::log_info!(
        "channel for project {} closed (generation {})",
        session.project_id,
        session.generation
    );
}
