//! Push channel over a WebSocket, using tokio-tungstenite.

use std::time::Duration;

use billsync_shared::ClientCommand;
use futures_channel::mpsc::unbounded;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Backoff, ConnectionState, PushOutcome, Session};
use crate::error::{Result, SyncError};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Why an open socket stopped being read.
enum Closed {
    Cancelled,
    Dropped,
}

/// Keep a socket open for the session, reconnecting with backoff.
pub(super) async fn run(session: &Session) -> PushOutcome {
    if let Err(e) = build_request(session) {
        // A bad URL or token will not fix itself on retry.
        crate::log_error!("cannot open WebSocket for {}: {}", session.project_id, e);
        session.set_state(ConnectionState::Failed {
            reason: e.to_string(),
        });
        return PushOutcome::Exhausted;
    }

    let mut attempt = 0u32;
    loop {
        if attempt == 0 {
            session.set_state(ConnectionState::Connecting);
        }

        let opened = tokio::select! {
            _ = session.cancel.cancelled() => return PushOutcome::Cancelled,
            opened = open(session) => opened,
        };

        match opened {
            Ok(socket) => {
                attempt = 0;
                session.set_state(ConnectionState::Connected);
                crate::log_info!("WebSocket connected for project {}", session.project_id);

                match drive(session, socket).await {
                    Closed::Cancelled => return PushOutcome::Cancelled,
                    Closed::Dropped => {
                        crate::log_info!("WebSocket for {} closed", session.project_id);
                    }
                }
            }
            Err(e) => {
                crate::log_error!("WebSocket error for {}: {}", session.project_id, e);
            }
        }

        match session.backoff(&mut attempt, "WebSocket").await {
            Backoff::Retry => {}
            Backoff::Exhausted => return PushOutcome::Exhausted,
            Backoff::Cancelled => return PushOutcome::Cancelled,
        }
    }
}

fn build_request(session: &Session) -> Result<Request> {
    let url = session.config.ws_url(&session.project_id)?;
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = &session.config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| SyncError::Config(format!("auth token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

async fn open(session: &Session) -> Result<Socket> {
    let request = build_request(session)?;
    let budget = session.config.connect_timeout;
    match tokio::time::timeout(budget, connect_async(request)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SyncError::Timeout(budget)),
    }
}

/// Pump one open socket until it drops or the session is cancelled.
async fn drive(session: &Session, socket: Socket) -> Closed {
    let (mut write, mut read) = socket.split();
    let (commands, mut outgoing) = unbounded::<ClientCommand>();
    session.registry.attach_socket(session.generation, commands);

    let period = heartbeat_period(session.config.heartbeat_interval);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let closed = loop {
        tokio::select! {
            _ = session.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break Closed::Cancelled;
            }
            _ = heartbeat.tick() => {
                if send_command(&mut write, &ClientCommand::Ping).await.is_err() {
                    break Closed::Dropped;
                }
            }
            Some(cmd) = outgoing.next() => {
                if send_command(&mut write, &cmd).await.is_err() {
                    break Closed::Dropped;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    crate::log_debug!("WebSocket received: {}", text.as_str());
                    session.push_frame(text.as_str().to_owned());
                }
                Some(Ok(Message::Close(frame))) => {
                    crate::log_info!(
                        "WebSocket for {} received close frame: {:?}",
                        session.project_id,
                        frame
                    );
                    break Closed::Dropped;
                }
                Some(Ok(_)) => {
                    // Protocol pings are answered by tungstenite; binary is not used.
                }
                Some(Err(e)) => {
                    crate::log_error!("WebSocket read error: {}", e);
                    break Closed::Dropped;
                }
                None => break Closed::Dropped,
            }
        }
    };

    session.registry.detach_socket(session.generation);
    closed
}

async fn send_command<S>(write: &mut S, cmd: &ClientCommand) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(cmd)
        .map_err(|e| SyncError::Config(format!("serialize {cmd:?}: {e}")))?;
    crate::log_debug!("Sending: {}", json);
    if let Err(e) = write.send(Message::Text(json.into())).await {
        crate::log_error!("Send failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn heartbeat_period(configured: Duration) -> Duration {
    configured.max(Duration::from_millis(10))
}
