//! Wire protocol for the project live channel.
//!
//! The server sends loosely shaped JSON envelopes keyed by an `event` name.
//! [`decode_server_message`] turns them into the closed [`ProjectEvent`] sum
//! type, with [`ProjectEvent::Unknown`] as the explicit forward-compatible
//! fallback. A recognized event whose `data` has the wrong shape is a
//! [`DecodeError`], never a silent fallthrough.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{CanonicalTotals, ProjectId, ProjectView};

pub const EVENT_PROJECT_SNAPSHOT: &str = "project_snapshot";
pub const EVENT_INVOICE_CREATED: &str = "invoice.created";
pub const EVENT_INVOICE_UPDATED: &str = "invoice.updated";
pub const EVENT_INVOICE_DELETED: &str = "invoice.deleted";
pub const EVENT_BOQ_ITEM_BILLED: &str = "boq.item_billed";
pub const EVENT_CONFLICT_DETECTED: &str = "conflict.detected";

/// Commands the client sends over an open socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    RequestSnapshot { project_id: ProjectId },
    Ping,
}

/// Invoice payload carried by `invoice.*` events. Everything is optional;
/// the totals that matter travel in `canonical_totals`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceEventData {
    pub invoice_id: Option<String>,
    pub invoice_number: Option<String>,
    pub amount: Option<f64>,
    pub ra_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoqItemBilled {
    pub item_id: String,
    pub billed_quantity: f64,
    pub available_quantity: f64,
}

/// Conflict warning. Never mutates state; surfaced to presentation code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectEvent {
    Snapshot(ProjectView),
    InvoiceCreated(InvoiceEventData),
    InvoiceUpdated(InvoiceEventData),
    InvoiceDeleted(InvoiceEventData),
    BoqItemBilled(BoqItemBilled),
    ConflictDetected(ConflictData),
    Unknown { name: String, data: Value },
}

impl ProjectEvent {
    /// The wire name this event was decoded from.
    pub fn name(&self) -> &str {
        match self {
            ProjectEvent::Snapshot(_) => EVENT_PROJECT_SNAPSHOT,
            ProjectEvent::InvoiceCreated(_) => EVENT_INVOICE_CREATED,
            ProjectEvent::InvoiceUpdated(_) => EVENT_INVOICE_UPDATED,
            ProjectEvent::InvoiceDeleted(_) => EVENT_INVOICE_DELETED,
            ProjectEvent::BoqItemBilled(_) => EVENT_BOQ_ITEM_BILLED,
            ProjectEvent::ConflictDetected(_) => EVENT_CONFLICT_DETECTED,
            ProjectEvent::Unknown { name, .. } => name,
        }
    }
}

/// A decoded event together with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub project_id: ProjectId,
    pub event: ProjectEvent,
    pub canonical_totals: Option<CanonicalTotals>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ServerEvent {
    pub fn snapshot(project_id: ProjectId, view: ProjectView) -> Self {
        Self {
            project_id,
            event: ProjectEvent::Snapshot(view),
            canonical_totals: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Event(ServerEvent),
    /// Heartbeat reply.
    Pong,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has neither an `event` nor a known `type`")]
    MissingEvent,

    #[error("event `{0}` has no project_id")]
    MissingProjectId(String),

    #[error("invalid data for `{event}`: {source}")]
    InvalidData {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    project_id: Option<ProjectId>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    canonical_totals: Option<CanonicalTotals>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Decode one text frame (socket message or SSE `data:` payload).
pub fn decode_server_message(text: &str) -> Result<ServerMessage, DecodeError> {
    let raw: RawEnvelope = serde_json::from_str(text)?;

    let Some(name) = raw.event else {
        return match raw.kind.as_deref() {
            Some("pong") => Ok(ServerMessage::Pong),
            _ => Err(DecodeError::MissingEvent),
        };
    };

    let project_id = raw
        .project_id
        .ok_or_else(|| DecodeError::MissingProjectId(name.clone()))?;

    let event = match name.as_str() {
        EVENT_PROJECT_SNAPSHOT => ProjectEvent::Snapshot(data_as(&name, raw.data)?),
        EVENT_INVOICE_CREATED => ProjectEvent::InvoiceCreated(data_as(&name, raw.data)?),
        EVENT_INVOICE_UPDATED => ProjectEvent::InvoiceUpdated(data_as(&name, raw.data)?),
        EVENT_INVOICE_DELETED => ProjectEvent::InvoiceDeleted(data_as(&name, raw.data)?),
        EVENT_BOQ_ITEM_BILLED => ProjectEvent::BoqItemBilled(data_as(&name, raw.data)?),
        EVENT_CONFLICT_DETECTED => ProjectEvent::ConflictDetected(data_as(&name, raw.data)?),
        _ => ProjectEvent::Unknown {
            name,
            data: raw.data,
        },
    };

    Ok(ServerMessage::Event(ServerEvent {
        project_id,
        event,
        canonical_totals: raw.canonical_totals,
        timestamp: raw.timestamp,
    }))
}

fn data_as<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, DecodeError> {
    // A missing `data` means "no payload", which optional-only shapes accept.
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidData {
        event: event.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_event(text: &str) -> ServerEvent {
        match decode_server_message(text).expect("decodes") {
            ServerMessage::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_snapshot() {
        let event = expect_event(
            r#"{"event":"project_snapshot","project_id":"P1","data":{"total_billed":100000,"total_invoices":2}}"#,
        );
        assert_eq!(event.project_id, ProjectId::from("P1"));
        let ProjectEvent::Snapshot(view) = event.event else {
            panic!("expected snapshot");
        };
        assert_eq!(view.total_billed, 100000.0);
        assert_eq!(view.total_invoices, 2);
    }

    #[test]
    fn decodes_incremental_with_envelope_metadata() {
        let event = expect_event(
            r#"{"event":"invoice.deleted","project_id":"P1","canonical_totals":{"total_billed":60000},"timestamp":"2024-05-01T10:00:00Z"}"#,
        );
        assert!(matches!(event.event, ProjectEvent::InvoiceDeleted(_)));
        assert_eq!(
            event.canonical_totals.and_then(|t| t.total_billed),
            Some(60000.0)
        );
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn unknown_event_keeps_its_name() {
        let event = expect_event(
            r#"{"event":"retention.released","project_id":"P1","data":{"x":1}}"#,
        );
        assert_eq!(event.event.name(), "retention.released");
    }

    #[test]
    fn boq_event_with_wrong_shape_is_rejected() {
        let err = decode_server_message(
            r#"{"event":"boq.item_billed","project_id":"P1","data":{"billed_quantity":"five"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidData { .. }));
    }

    #[test]
    fn pong_and_garbage() {
        assert_eq!(
            decode_server_message(r#"{"type":"pong"}"#).unwrap(),
            ServerMessage::Pong
        );
        assert!(matches!(
            decode_server_message("not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_server_message(r#"{"event":"invoice.created"}"#),
            Err(DecodeError::MissingProjectId(_))
        ));
    }

    #[test]
    fn client_commands_match_wire_shape() {
        let cmd = ClientCommand::RequestSnapshot {
            project_id: ProjectId::from("P1"),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            serde_json::json!({"type": "request_snapshot", "project_id": "P1"})
        );
        assert_eq!(
            serde_json::to_value(&ClientCommand::Ping).unwrap(),
            serde_json::json!({"type": "ping"})
        );
    }
}
