//! Project billing models as seen by the client cache.
//!
//! Field names follow the backend's snake_case JSON. Every field of
//! [`ProjectView`] defaults, so a partial snapshot still decodes into a
//! usable view with zeros and empty collections for whatever is missing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Identity ---

/// Opaque project identifier used as the store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// --- Bill of quantities ---

/// One line of a project's bill of quantities.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoqItemView {
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub total_quantity: f64,
    #[serde(default)]
    pub billed_quantity: f64,
    #[serde(default)]
    pub available_quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

// --- Invoices ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LastInvoice {
    pub invoice_number: String,
    #[serde(default)]
    pub amount: f64,
    /// Running-account bill tag (e.g. "RA-3").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ra_tag: Option<String>,
}

/// Marker attached to a view while an invoice creation is awaiting
/// server confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingInvoice {
    pub update_id: Uuid,
    pub invoice_number: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ra_tag: Option<String>,
}

// --- Project view ---

/// Cached billing state for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectView {
    pub total_billed: f64,
    pub remaining_value: f64,
    pub completion_percentage: f64,
    pub total_invoices: u32,
    pub boq_items: Vec<BoqItemView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_invoice: Option<LastInvoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_invoice: Option<PendingInvoice>,
}

impl ProjectView {
    /// Completion derived from the totals currently held, for display.
    ///
    /// Returns 0 when there is nothing billed and nothing remaining.
    pub fn derived_completion(&self) -> f64 {
        let contract_value = self.total_billed + self.remaining_value;
        if contract_value > 0.0 {
            self.total_billed / contract_value * 100.0
        } else {
            0.0
        }
    }

    pub fn boq_item(&self, item_id: &str) -> Option<&BoqItemView> {
        self.boq_items.iter().find(|item| item.item_id == item_id)
    }
}

/// Server-computed aggregates. The client never recomputes these from line
/// items; it only merges whatever subset the server sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanonicalTotals {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_billed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_invoices: Option<u32>,
}

impl CanonicalTotals {
    pub fn is_empty(&self) -> bool {
        self.total_billed.is_none()
            && self.remaining_value.is_none()
            && self.completion_percentage.is_none()
            && self.total_invoices.is_none()
    }
}
