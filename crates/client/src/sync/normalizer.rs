//! Event normalizer: maps every decoded server event onto a store update.
//!
//! This is a pure function of the current view and the event. Monetary
//! totals only ever come from the server's `canonical_totals`; the client
//! derives `completion_percentage` for display when the server left it out
//! and never recomputes anything else.

use billsync_shared::{
    CanonicalTotals, ConflictData, InvoiceEventData, LastInvoice, ProjectEvent, ProjectId,
    ProjectView, ServerEvent,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::stores::{ProjectPatch, StoreUpdate};

/// Side-channel warning for presentation code.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictNotice {
    pub project_id: ProjectId,
    pub message: String,
    pub details: Map<String, Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// What applying one event amounts to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub update: Option<StoreUpdate>,
    /// Optimistic update that this event confirmed.
    pub confirmed: Option<Uuid>,
    pub conflict: Option<ConflictNotice>,
}

impl Outcome {
    fn store(update: StoreUpdate) -> Self {
        Self {
            update: Some(update),
            ..Default::default()
        }
    }
}

/// Normalize `event` against the view currently cached for its project.
pub fn normalize(current: &ProjectView, event: ServerEvent) -> Outcome {
    let ServerEvent {
        project_id,
        event,
        canonical_totals,
        timestamp,
    } = event;

    if let ProjectEvent::Snapshot(mut view) = event {
        // Data is taken wholesale; the stale guard never moves backwards.
        view.last_event_timestamp = [
            view.last_event_timestamp,
            timestamp,
            current.last_event_timestamp,
        ]
        .into_iter()
        .flatten()
        .max();
        return Outcome::store(StoreUpdate::Replace(view));
    }

    if let ProjectEvent::ConflictDetected(data) = event {
        return Outcome {
            conflict: Some(conflict_notice(project_id, data, timestamp)),
            ..Default::default()
        };
    }

    if is_stale(current, timestamp) {
        crate::log_debug!(
            "dropping stale `{}` for {} ({:?} < {:?})",
            event.name(),
            project_id,
            timestamp,
            current.last_event_timestamp
        );
        return Outcome::default();
    }

    let totals = canonical_totals.unwrap_or_default();
    let mut patch = totals_patch(current, &totals);
    patch.last_event_timestamp = timestamp;

    match event {
        ProjectEvent::InvoiceCreated(data) => {
            let mut confirmed = None;
            let absorbs_pending = current
                .pending_invoice
                .as_ref()
                .filter(|pending| {
                    data.invoice_number
                        .as_ref()
                        .map_or(true, |number| *number == pending.invoice_number)
                });

            patch.total_invoices = Some(match (totals.total_invoices, absorbs_pending) {
                (Some(count), _) => count,
                // The speculative increment already counted this invoice.
                (None, Some(_)) => current.total_invoices,
                (None, None) => current.total_invoices.saturating_add(1),
            });
            if let Some(pending) = absorbs_pending {
                confirmed = Some(pending.update_id);
                patch.pending_invoice = Some(None);
            }
            if let Some(invoice) = last_invoice_from(&data) {
                patch.last_invoice = Some(Some(invoice));
            }

            Outcome {
                update: Some(StoreUpdate::Merge(patch)),
                confirmed,
                conflict: None,
            }
        }
        ProjectEvent::InvoiceUpdated(data) => {
            let same_invoice = current.last_invoice.as_ref().is_some_and(|last| {
                data.invoice_number.as_deref() == Some(last.invoice_number.as_str())
            });
            if same_invoice {
                patch.last_invoice = Some(last_invoice_from(&data));
            }
            Outcome::store(StoreUpdate::Merge(patch))
        }
        ProjectEvent::InvoiceDeleted(data) => {
            patch.total_invoices = Some(
                totals
                    .total_invoices
                    .unwrap_or_else(|| current.total_invoices.saturating_sub(1)),
            );
            let deleted_last = current.last_invoice.as_ref().is_some_and(|last| {
                data.invoice_number.as_deref() == Some(last.invoice_number.as_str())
            });
            if deleted_last {
                patch.last_invoice = Some(None);
            }
            Outcome::store(StoreUpdate::Merge(patch))
        }
        ProjectEvent::BoqItemBilled(billed) => {
            if current.boq_item(&billed.item_id).is_some() {
                Outcome::store(StoreUpdate::BillBoqItem {
                    item_id: billed.item_id,
                    billed_quantity: billed.billed_quantity,
                    available_quantity: billed.available_quantity,
                    patch,
                })
            } else if !totals.is_empty() {
                crate::log_warn!(
                    "boq item {} not cached for {}; merging totals only",
                    billed.item_id,
                    project_id
                );
                Outcome::store(StoreUpdate::Merge(patch))
            } else {
                crate::log_warn!("boq item {} not cached for {}", billed.item_id, project_id);
                Outcome::default()
            }
        }
        ProjectEvent::Unknown { name, .. } => {
            if totals.is_empty() {
                crate::log_debug!("ignoring unrecognized event `{}` for {}", name, project_id);
                Outcome::default()
            } else {
                Outcome::store(StoreUpdate::Merge(patch))
            }
        }
        ProjectEvent::Snapshot(_) | ProjectEvent::ConflictDetected(_) => Outcome::default(),
    }
}

/// An incremental event older than what the view already reflects.
fn is_stale(current: &ProjectView, timestamp: Option<DateTime<Utc>>) -> bool {
    match (timestamp, current.last_event_timestamp) {
        (Some(incoming), Some(applied)) => incoming < applied,
        _ => false,
    }
}

fn totals_patch(current: &ProjectView, totals: &CanonicalTotals) -> ProjectPatch {
    let mut patch = ProjectPatch {
        total_billed: totals.total_billed,
        remaining_value: totals.remaining_value,
        completion_percentage: totals.completion_percentage,
        total_invoices: totals.total_invoices,
        ..Default::default()
    };

    let money_moved = totals.total_billed.is_some() || totals.remaining_value.is_some();
    if patch.completion_percentage.is_none() && money_moved {
        let merged = ProjectView {
            total_billed: totals.total_billed.unwrap_or(current.total_billed),
            remaining_value: totals.remaining_value.unwrap_or(current.remaining_value),
            ..Default::default()
        };
        patch.completion_percentage = Some(merged.derived_completion());
    }
    patch
}

fn last_invoice_from(data: &InvoiceEventData) -> Option<LastInvoice> {
    let invoice_number = data.invoice_number.clone()?;
    Some(LastInvoice {
        invoice_number,
        amount: data.amount.unwrap_or_default(),
        ra_tag: data.ra_tag.clone(),
    })
}

fn conflict_notice(
    project_id: ProjectId,
    data: ConflictData,
    timestamp: Option<DateTime<Utc>>,
) -> ConflictNotice {
    ConflictNotice {
        message: data
            .message
            .unwrap_or_else(|| format!("conflicting change on project {project_id}")),
        project_id,
        details: data.details,
        timestamp,
    }
}
