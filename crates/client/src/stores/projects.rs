//! Project state store: the cached billing view of every project.
//!
//! Views are held behind `Arc` and never mutated in place. Every write
//! builds a new `ProjectView` (and a new `boq_items` sequence when a line
//! item changes), so a consumer holding the previous `Arc` can detect the
//! change with `Arc::ptr_eq` and siblings compare equal by value.
//!
//! Writers are crate-private: the sync reducer and the optimistic tracker
//! are the only code allowed to change what presentation code sees.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use billsync_shared::{BoqItemView, LastInvoice, PendingInvoice, ProjectId, ProjectView};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Shallow top-level patch over a [`ProjectView`]. `None` leaves the field
/// alone; sub-objects are replaced whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub total_billed: Option<f64>,
    pub remaining_value: Option<f64>,
    pub completion_percentage: Option<f64>,
    pub total_invoices: Option<u32>,
    pub boq_items: Option<Vec<BoqItemView>>,
    pub last_invoice: Option<Option<LastInvoice>>,
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub pending_invoice: Option<Option<PendingInvoice>>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        *self == ProjectPatch::default()
    }

    pub fn apply_to(self, view: &mut ProjectView) {
        if let Some(v) = self.total_billed {
            view.total_billed = v;
        }
        if let Some(v) = self.remaining_value {
            view.remaining_value = v;
        }
        if let Some(v) = self.completion_percentage {
            view.completion_percentage = v;
        }
        if let Some(v) = self.total_invoices {
            view.total_invoices = v;
        }
        if let Some(v) = self.boq_items {
            view.boq_items = v;
        }
        if let Some(v) = self.last_invoice {
            view.last_invoice = v;
        }
        if let Some(v) = self.last_event_timestamp {
            view.last_event_timestamp = Some(v);
        }
        if let Some(v) = self.pending_invoice {
            view.pending_invoice = v;
        }
    }
}

/// A normalized mutation, ready to be applied to one project's view.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// Wholesale replacement (snapshots).
    Replace(ProjectView),
    Merge(ProjectPatch),
    /// Rewrite one BOQ line's quantities, then merge `patch`.
    BillBoqItem {
        item_id: String,
        billed_quantity: f64,
        available_quantity: f64,
        patch: ProjectPatch,
    },
}

/// Keyed cache of project views with change notification.
#[derive(Debug)]
pub struct ProjectStore {
    views: RwLock<HashMap<ProjectId, Arc<ProjectView>>>,
    revision: watch::Sender<u64>,
}

impl Default for ProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectStore {
    pub fn new() -> Self {
        Self {
            views: RwLock::new(HashMap::new()),
            revision: watch::channel(0).0,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ProjectId, Arc<ProjectView>>> {
        self.views.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ProjectId, Arc<ProjectView>>> {
        self.views.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Current view of a project; an empty default view if none is cached.
    pub fn get(&self, project_id: &ProjectId) -> Arc<ProjectView> {
        self.read()
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(ProjectView::default()))
    }

    pub fn contains(&self, project_id: &ProjectId) -> bool {
        self.read().contains_key(project_id)
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of writes applied so far.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver that wakes on every store write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Create an empty view for a project if none exists yet.
    pub(crate) fn ensure(&self, project_id: &ProjectId) {
        let inserted = {
            let mut views = self.write();
            if views.contains_key(project_id) {
                false
            } else {
                views.insert(project_id.clone(), Arc::new(ProjectView::default()));
                true
            }
        };
        if inserted {
            self.bump();
        }
    }

    pub(crate) fn replace(&self, project_id: &ProjectId, view: ProjectView) {
        self.write().insert(project_id.clone(), Arc::new(view));
        self.bump();
    }

    pub(crate) fn merge(&self, project_id: &ProjectId, patch: ProjectPatch) {
        self.update(project_id, |current| {
            let mut next = current.clone();
            patch.apply_to(&mut next);
            Some(next)
        });
    }

    /// Functional update: `f` sees the current view and returns its
    /// replacement, or `None` to leave the project untouched.
    pub(crate) fn update(
        &self,
        project_id: &ProjectId,
        f: impl FnOnce(&ProjectView) -> Option<ProjectView>,
    ) -> bool {
        let changed = {
            let mut views = self.write();
            let current = views
                .get(project_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(ProjectView::default()));
            match f(&current) {
                Some(next) => {
                    views.insert(project_id.clone(), Arc::new(next));
                    true
                }
                None => false,
            }
        };
        if changed {
            self.bump();
        }
        changed
    }

    pub(crate) fn apply(&self, project_id: &ProjectId, update: StoreUpdate) {
        match update {
            StoreUpdate::Replace(view) => self.replace(project_id, view),
            StoreUpdate::Merge(patch) => self.merge(project_id, patch),
            StoreUpdate::BillBoqItem {
                item_id,
                billed_quantity,
                available_quantity,
                patch,
            } => {
                self.update(project_id, |current| {
                    current.boq_item(&item_id)?;
                    let mut next = ProjectView {
                        boq_items: with_item_quantities(
                            &current.boq_items,
                            &item_id,
                            billed_quantity,
                            available_quantity,
                        ),
                        ..current.clone()
                    };
                    patch.apply_to(&mut next);
                    Some(next)
                });
            }
        }
    }

    /// Drop every cached view (provider teardown).
    pub(crate) fn clear(&self) {
        self.write().clear();
        self.bump();
    }
}

/// New BOQ sequence where only `item_id`'s two quantity fields differ.
fn with_item_quantities(
    items: &[BoqItemView],
    item_id: &str,
    billed_quantity: f64,
    available_quantity: f64,
) -> Vec<BoqItemView> {
    items
        .iter()
        .map(|item| {
            if item.item_id == item_id {
                BoqItemView {
                    billed_quantity,
                    available_quantity,
                    ..item.clone()
                }
            } else {
                item.clone()
            }
        })
        .collect()
}
