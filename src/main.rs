//! Billsync - watch a project's billing totals live from the terminal.
//!
//! Usage: `billsync <project-id>`. Connection settings come from the
//! `BILLSYNC_*` environment variables.

use anyhow::{bail, Context, Result};
use billsync_client::{ProjectSyncProvider, SyncConfig};
use billsync_shared::ProjectId;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "billsync=info,billsync_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(project_id) = std::env::args().nth(1) else {
        bail!("usage: billsync <project-id>");
    };
    let project_id = ProjectId::new(project_id);

    let config = SyncConfig::from_env().context("reading BILLSYNC_* configuration")?;
    tracing::info!(
        "Watching project {} at {} ({:?})",
        project_id,
        config.base_url,
        config.transport
    );

    let provider = ProjectSyncProvider::new(config);
    let mut changes = provider.subscribe();
    let mut states = provider.subscribe_state();
    let mut conflicts = provider.conflicts();
    provider.connect(project_id.clone());

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let project = provider.project_data(&project_id);
                let view = &project.data;
                tracing::info!(
                    "billed {:.2} / remaining {:.2} ({:.1}%), {} invoices, {} BOQ items",
                    view.total_billed,
                    view.remaining_value,
                    view.completion_percentage,
                    view.total_invoices,
                    view.boq_items.len()
                );
                if let Some(last) = &view.last_invoice {
                    tracing::info!("last invoice {} for {:.2}", last.invoice_number, last.amount);
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                tracing::info!("connection: {:?}", state);
            }
            notice = conflicts.recv() => {
                if let Ok(notice) = notice {
                    tracing::warn!("conflict on {}: {}", notice.project_id, notice.message);
                }
            }
        }
    }

    provider.shutdown();
    Ok(())
}
