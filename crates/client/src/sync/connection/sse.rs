//! Push channel over server-sent events, read from a streaming HTTP body.

use futures_util::StreamExt;

use super::{Backoff, ConnectionState, PushOutcome, Session};
use crate::error::SyncError;

/// Longest unterminated line the decoder will hold.
pub(crate) const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental `text/event-stream` parser.
///
/// Feeds arbitrary byte chunks and yields the `data` payload of each
/// completed event. Event names, ids and retry hints are ignored: every
/// payload carries its own `event` field. A line longer than
/// [`MAX_LINE_BYTES`] is skipped along with the event it belongs to.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
    /// Dropping the rest of an event that had an oversized line.
    skipping: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if self.skipping {
                // Resume at the blank line that ends the dropped event.
                self.skipping = !line.is_empty();
                continue;
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        if self.buf.len() > MAX_LINE_BYTES {
            crate::log_warn!(
                "event stream line exceeds {} bytes; dropping the event",
                MAX_LINE_BYTES
            );
            self.buf.clear();
            self.data.clear();
            self.skipping = true;
        }

        events
    }
}

/// Keep an event stream open for the session, reconnecting with backoff.
pub(super) async fn run(session: &Session) -> PushOutcome {
    let mut attempt = 0u32;
    loop {
        if attempt == 0 {
            session.set_state(ConnectionState::Connecting);
        }

        let budget = session.config.connect_timeout;
        let opened = tokio::select! {
            _ = session.cancel.cancelled() => return PushOutcome::Cancelled,
            opened = tokio::time::timeout(budget, session.api.open_event_stream(&session.project_id)) => {
                match opened {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(e)) => Err(SyncError::from(e)),
                    Err(_) => Err(SyncError::Timeout(budget)),
                }
            }
        };

        match opened {
            Ok(resp) => {
                attempt = 0;
                session.set_state(ConnectionState::Connected);
                crate::log_info!("event stream open for project {}", session.project_id);

                let mut body = resp.bytes_stream();
                let mut decoder = SseDecoder::new();
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => return PushOutcome::Cancelled,
                        chunk = body.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for data in decoder.feed(&bytes) {
                                    session.push_frame(data);
                                }
                            }
                            Some(Err(e)) => {
                                crate::log_error!("event stream read error: {}", e);
                                break;
                            }
                            None => {
                                crate::log_info!("event stream for {} ended", session.project_id);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                crate::log_error!("event stream error for {}: {}", session.project_id, e);
            }
        }

        match session.backoff(&mut attempt, "event stream").await {
            Backoff::Retry => {}
            Backoff::Exhausted => return PushOutcome::Exhausted,
            Backoff::Cancelled => return PushOutcome::Cancelled,
        }
    }
}
