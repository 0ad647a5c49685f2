//! Optimistic update ledger.
//!
//! `begin` applies a speculative mutation to the project store right away
//! and records, alongside the ledger entry, the inverse mutation computed
//! from the view it actually changed. A failed `resolve` applies that
//! inverse unless an authoritative event or snapshot already replaced the
//! speculated value; a successful one leaves the view alone and lets the
//! next authoritative update supersede it.
//!
//! Only one speculative update per logical action is expected. Concurrent
//! updates against the same field are neither ordered nor merged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use billsync_shared::{PendingInvoice, ProjectId, ProjectView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::projects::ProjectStore;

/// The speculative action being shown before the server confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimisticKind {
    InvoiceCreate {
        invoice_number: String,
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ra_tag: Option<String>,
    },
    InvoiceDelete {
        invoice_number: String,
    },
    BoqBill {
        item_id: String,
        quantity: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Pending,
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticUpdate {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub kind: OptimisticKind,
    pub timestamp: DateTime<Utc>,
    pub status: UpdateStatus,
}

/// Inverse of a speculative mutation, captured when it was applied.
///
/// Each variant also records what the view looked like right after the
/// speculation. The inverse only applies while that still holds; once an
/// authoritative event or snapshot has replaced the value, it stays.
#[derive(Debug, Clone, PartialEq)]
enum Rollback {
    Noop,
    /// Guarded by the pending marker carrying this update's id.
    UncountInvoice,
    RecountInvoice {
        expected: u32,
    },
    UnbillBoqItem {
        item_id: String,
        billed: f64,
        available: f64,
        expected_billed: f64,
        expected_available: f64,
    },
}

#[derive(Debug)]
struct Entry {
    update: OptimisticUpdate,
    rollback: Rollback,
}

#[derive(Debug)]
pub struct OptimisticTracker {
    store: Arc<ProjectStore>,
    ledger: Mutex<HashMap<Uuid, Entry>>,
}

impl OptimisticTracker {
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self {
            store,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a pending update and apply its speculative mutation.
    pub fn begin(&self, project_id: &ProjectId, kind: OptimisticKind) -> Uuid {
        let id = Uuid::new_v4();
        let mut rollback = Rollback::Noop;

        self.store.update(project_id, |view| {
            let (next, inverse) = speculate(view, id, &kind)?;
            rollback = inverse;
            Some(next)
        });

        crate::log_debug!("optimistic update {} began for {}: {:?}", id, project_id, kind);

        self.ledger().insert(
            id,
            Entry {
                update: OptimisticUpdate {
                    id,
                    project_id: project_id.clone(),
                    kind,
                    timestamp: Utc::now(),
                    status: UpdateStatus::Pending,
                },
                rollback,
            },
        );
        id
    }

    /// Settle an update. Failure reverts the speculative mutation.
    ///
    /// Returns the removed entry with its final status, or `None` if the id
    /// is unknown (already resolved or confirmed by a server event).
    pub fn resolve(&self, update_id: Uuid, success: bool) -> Option<OptimisticUpdate> {
        let Entry {
            mut update,
            rollback,
        } = self.ledger().remove(&update_id)?;

        if success {
            update.status = UpdateStatus::Confirmed;
        } else {
            let reverted = self
                .store
                .update(&update.project_id, |view| revert(view, update_id, &rollback));
            update.status = UpdateStatus::Reverted;
            if reverted {
                crate::log_info!("optimistic update {} reverted for {}", update_id, update.project_id);
            } else {
                crate::log_info!(
                    "optimistic update {} failed for {}; view already superseded",
                    update_id,
                    update.project_id
                );
            }
        }
        Some(update)
    }

    /// Drop an entry that a server event has already confirmed.
    pub(crate) fn confirm(&self, update_id: Uuid) -> Option<OptimisticUpdate> {
        let mut entry = self.ledger().remove(&update_id)?;
        entry.update.status = UpdateStatus::Confirmed;
        Some(entry.update)
    }

    /// Pending entries for one project, oldest first.
    pub fn pending(&self, project_id: &ProjectId) -> Vec<OptimisticUpdate> {
        let mut updates: Vec<_> = self
            .ledger()
            .values()
            .filter(|entry| &entry.update.project_id == project_id)
            .map(|entry| entry.update.clone())
            .collect();
        updates.sort_by_key(|update| update.timestamp);
        updates
    }

    pub fn contains(&self, update_id: Uuid) -> bool {
        self.ledger().contains_key(&update_id)
    }

    pub fn len(&self) -> usize {
        self.ledger().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.ledger().clear();
    }
}

fn speculate(
    view: &ProjectView,
    id: Uuid,
    kind: &OptimisticKind,
) -> Option<(ProjectView, Rollback)> {
    match kind {
        OptimisticKind::InvoiceCreate {
            invoice_number,
            amount,
            ra_tag,
        } => Some((
            ProjectView {
                total_invoices: view.total_invoices.saturating_add(1),
                pending_invoice: Some(PendingInvoice {
                    update_id: id,
                    invoice_number: invoice_number.clone(),
                    amount: *amount,
                    ra_tag: ra_tag.clone(),
                }),
                ..view.clone()
            },
            Rollback::UncountInvoice,
        )),
        OptimisticKind::InvoiceDelete { .. } => {
            if view.total_invoices == 0 {
                return None;
            }
            Some((
                ProjectView {
                    total_invoices: view.total_invoices - 1,
                    ..view.clone()
                },
                Rollback::RecountInvoice {
                    expected: view.total_invoices - 1,
                },
            ))
        }
        OptimisticKind::BoqBill { item_id, quantity } => {
            let item = view.boq_item(item_id)?;
            let taken = quantity.min(item.available_quantity).max(0.0);
            let expected_billed = item.billed_quantity + quantity;
            let expected_available = item.available_quantity - taken;
            let mut next = view.clone();
            for entry in next.boq_items.iter_mut().filter(|i| &i.item_id == item_id) {
                entry.billed_quantity += quantity;
                entry.available_quantity -= taken;
            }
            Some((
                next,
                Rollback::UnbillBoqItem {
                    item_id: item_id.clone(),
                    billed: *quantity,
                    available: taken,
                    expected_billed,
                    expected_available,
                },
            ))
        }
    }
}

/// The inverse of `rollback`, or `None` when the speculated value is gone.
fn revert(view: &ProjectView, id: Uuid, rollback: &Rollback) -> Option<ProjectView> {
    let mut next = view.clone();
    match rollback {
        Rollback::Noop => return None,
        Rollback::UncountInvoice => {
            let still_pending = view
                .pending_invoice
                .as_ref()
                .is_some_and(|pending| pending.update_id == id);
            if !still_pending {
                return None;
            }
            next.total_invoices = next.total_invoices.saturating_sub(1);
            next.pending_invoice = None;
        }
        Rollback::RecountInvoice { expected } => {
            if view.total_invoices != *expected {
                return None;
            }
            next.total_invoices = next.total_invoices.saturating_add(1);
        }
        Rollback::UnbillBoqItem {
            item_id,
            billed,
            available,
            expected_billed,
            expected_available,
        } => {
            let item = view.boq_item(item_id)?;
            if item.billed_quantity != *expected_billed
                || item.available_quantity != *expected_available
            {
                return None;
            }
            for entry in next.boq_items.iter_mut().filter(|i| &i.item_id == item_id) {
                entry.billed_quantity = (entry.billed_quantity - billed).max(0.0);
                entry.available_quantity += available;
            }
        }
    }
    Some(next)
}
