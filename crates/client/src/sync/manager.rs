//! Project sync provider: owns the store, the optimistic ledger and the one
//! live channel, and funnels every inbound payload through a single reducer
//! task so writes are applied in arrival order.

use std::sync::Arc;

use billsync_shared::{decode_server_message, ProjectId, ServerEvent, ServerMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{
    run_session, ConnectionState, Inbound, InboundPayload, Session, SessionRegistry, SocketHandle,
};
use super::normalizer::{normalize, ConflictNotice};
use crate::api_client::{ApiClient, SnapshotSource};
use crate::config::SyncConfig;
use crate::stores::{OptimisticKind, OptimisticTracker, OptimisticUpdate, ProjectStore};

const CONFLICT_CAPACITY: usize = 64;

/// State shared between the provider handle and its reducer task.
struct Shared {
    store: Arc<ProjectStore>,
    optimistic: OptimisticTracker,
    registry: Arc<SessionRegistry>,
    conflicts: broadcast::Sender<ConflictNotice>,
}

impl Shared {
    fn ingest(&self, inbound: Inbound) {
        if let Some(generation) = inbound.generation {
            if !self.registry.is_current(generation) {
                crate::log_debug!("discarding payload from closed session {}", generation);
                return;
            }
        }

        let event = match inbound.payload {
            InboundPayload::Frame(text) => match decode_server_message(&text) {
                Ok(ServerMessage::Event(event)) => event,
                Ok(ServerMessage::Pong) => return,
                Err(e) => {
                    crate::log_warn!("dropping malformed payload: {}", e);
                    return;
                }
            },
            InboundPayload::Snapshot { project_id, view } => ServerEvent::snapshot(project_id, view),
        };

        match inbound.generation {
            // Hold the registry so a disconnect cannot interleave with the write.
            Some(generation) => {
                let applied = self.registry.with_current(generation, |session_project| {
                    if event.project_id != *session_project {
                        crate::log_warn!(
                            "dropping `{}` for {} from the {} channel",
                            event.event.name(),
                            event.project_id,
                            session_project
                        );
                        return;
                    }
                    self.apply(event)
                });
                if applied.is_none() {
                    crate::log_debug!("session {} closed before apply", generation);
                }
            }
            None => self.apply(event),
        }
    }

    fn apply(&self, event: ServerEvent) {
        let project_id = event.project_id.clone();
        let name = event.event.name().to_string();
        let outcome = normalize(&self.store.get(&project_id), event);

        if let Some(update) = outcome.update {
            self.store.apply(&project_id, update);
        } else {
            crate::log_debug!("{} for {} left the view unchanged", name, project_id);
        }
        if let Some(update_id) = outcome.confirmed {
            if self.optimistic.confirm(update_id).is_some() {
                crate::log_debug!("optimistic update {} confirmed by {}", update_id, name);
            }
        }
        if let Some(notice) = outcome.conflict {
            crate::log_warn!(
                "conflict reported for {}: {}",
                notice.project_id,
                notice.message
            );
            let _ = self.conflicts.send(notice);
        }
    }
}

async fn run_reducer(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.recv() => next,
        };
        match next {
            Some(msg) => shared.ingest(msg),
            None => break,
        }
    }
    crate::log_debug!("sync reducer stopped");
}

/// Keeps one project's billing view current and exposes it to consumers.
///
/// Must be created inside a tokio runtime. Dropping the provider stops
/// every task it spawned.
pub struct ProjectSyncProvider {
    config: Arc<SyncConfig>,
    api: ApiClient,
    snapshots: Arc<dyn SnapshotSource>,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
}

impl ProjectSyncProvider {
    pub fn new(config: SyncConfig) -> Self {
        let api = ApiClient::new(config.clone());
        let snapshots: Arc<dyn SnapshotSource> = Arc::new(api.clone());
        Self::build(config, api, snapshots)
    }

    /// Provider whose polling and manual refreshes read from `snapshots`
    /// instead of the REST endpoint.
    pub fn with_snapshot_source(config: SyncConfig, snapshots: Arc<dyn SnapshotSource>) -> Self {
        let api = ApiClient::new(config.clone());
        Self::build(config, api, snapshots)
    }

    fn build(config: SyncConfig, api: ApiClient, snapshots: Arc<dyn SnapshotSource>) -> Self {
        let store = Arc::new(ProjectStore::new());
        let shared = Arc::new(Shared {
            optimistic: OptimisticTracker::new(store.clone()),
            store,
            registry: Arc::new(SessionRegistry::new()),
            conflicts: broadcast::channel(CONFLICT_CAPACITY).0,
        });

        let (inbound, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_reducer(shared.clone(), receiver, cancel.clone()));

        Self {
            config: Arc::new(config),
            api,
            snapshots,
            shared,
            inbound,
            cancel,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open the live channel for `project_id`.
    ///
    /// A no-op when that project is already current. Switching projects
    /// tears down the previous channel before the new one starts reporting.
    pub fn connect(&self, project_id: impl Into<ProjectId>) {
        let project_id = project_id.into();
        let Some((generation, cancel)) = self.shared.registry.begin(&project_id, &self.cancel)
        else {
            crate::log_debug!("already connected to project {}", project_id);
            return;
        };

        self.shared.store.ensure(&project_id);
        let session = Session {
            generation,
            project_id,
            config: self.config.clone(),
            api: self.api.clone(),
            snapshots: self.snapshots.clone(),
            registry: self.shared.registry.clone(),
            inbound: self.inbound.clone(),
            cancel,
        };
        tokio::spawn(run_session(session));
    }

    /// Close the live channel. Cached views stay readable.
    pub fn disconnect(&self) {
        if let Some(project_id) = self.shared.registry.end() {
            crate::log_info!("disconnected from project {}", project_id);
        }
    }

    /// Ask for a fresh snapshot: over the open socket when there is one,
    /// otherwise with a one-off REST fetch.
    pub fn request_snapshot(&self, project_id: impl Into<ProjectId>) {
        let project_id = project_id.into();
        if let Some(handle) = self.shared.registry.socket_for(&project_id) {
            if handle.request_snapshot().is_ok() {
                return;
            }
        }

        let snapshots = self.snapshots.clone();
        let inbound = self.inbound.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return,
                fetched = snapshots.fetch_snapshot(&project_id) => fetched,
            };
            match fetched {
                Ok(view) => {
                    let _ = inbound.send(Inbound {
                        generation: None,
                        payload: InboundPayload::Snapshot { project_id, view },
                    });
                }
                Err(e) => crate::log_warn!("snapshot refresh for {} failed: {}", project_id, e),
            }
        });
    }

    /// Show `kind` immediately; see [`OptimisticTracker::begin`].
    pub fn begin_optimistic(&self, project_id: &ProjectId, kind: OptimisticKind) -> Uuid {
        self.shared.optimistic.begin(project_id, kind)
    }

    /// Settle an optimistic update; see [`OptimisticTracker::resolve`].
    pub fn resolve_optimistic(&self, update_id: Uuid, success: bool) -> Option<OptimisticUpdate> {
        self.shared.optimistic.resolve(update_id, success)
    }

    pub fn store(&self) -> &ProjectStore {
        &self.shared.store
    }

    pub fn optimistic(&self) -> &OptimisticTracker {
        &self.shared.optimistic
    }

    pub fn current_project(&self) -> Option<ProjectId> {
        self.shared.registry.current_project()
    }

    /// State of the current project's channel.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.registry.state()
    }

    /// Handle to the open socket for `project_id`, if any.
    pub fn socket_handle(&self, project_id: &ProjectId) -> Option<SocketHandle> {
        self.shared.registry.socket_for(project_id)
    }

    /// Wakes on every store write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.store.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.registry.subscribe()
    }

    /// Conflicts reported by the server from now on.
    pub fn conflicts(&self) -> broadcast::Receiver<ConflictNotice> {
        self.shared.conflicts.subscribe()
    }

    /// Stop everything and drop all cached state.
    pub fn shutdown(&self) {
        self.disconnect();
        self.cancel.cancel();
        self.shared.optimistic.clear();
        self.shared.store.clear();
        crate::log_info!("sync provider shut down");
    }
}

impl Drop for ProjectSyncProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use billsync_shared::{ApiError, ProjectView};
    use serde_json::json;

    use super::*;
    use crate::config::TransportMode;

    struct FixedSnapshot(ProjectView);

    #[async_trait]
    impl SnapshotSource for FixedSnapshot {
        async fn fetch_snapshot(&self, _: &ProjectId) -> Result<ProjectView, ApiError> {
            Ok(self.0.clone())
        }
    }

    fn provider(view: ProjectView) -> ProjectSyncProvider {
        // Nothing listens here; only the REST seam is exercised.
        let config = SyncConfig::new("http://127.0.0.1:9").with_transport(TransportMode::Sse);
        ProjectSyncProvider::with_snapshot_source(config, Arc::new(FixedSnapshot(view)))
    }

    async fn wait_for_revision(rx: &mut watch::Receiver<u64>, target: u64) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|rev| *rev >= target))
            .await
            .expect("store write in time")
            .expect("store alive");
    }

    fn frame(generation: Option<u64>, value: serde_json::Value) -> Inbound {
        Inbound {
            generation,
            payload: InboundPayload::Frame(value.to_string()),
        }
    }

    #[tokio::test]
    async fn manual_refresh_lands_in_the_store() {
        let provider = provider(ProjectView {
            total_billed: 500.0,
            total_invoices: 2,
            ..Default::default()
        });
        let mut rx = provider.subscribe();
        let p1 = ProjectId::from("P1");

        provider.request_snapshot(p1.clone());
        wait_for_revision(&mut rx, 1).await;

        assert_eq!(provider.store().get(&p1).total_invoices, 2);
        assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn payloads_from_closed_sessions_are_discarded() {
        let provider = provider(ProjectView::default());
        let p1 = ProjectId::from("P1");
        provider.connect(p1.clone());
        assert_eq!(provider.current_project(), Some(p1.clone()));
        provider.disconnect();
        assert_eq!(provider.current_project(), None);

        let before = provider.store().revision();
        provider.shared.ingest(frame(
            Some(1),
            json!({"event": "invoice.created", "project_id": "P1", "data": {"invoice_number": "INV-1"}}),
        ));
        assert_eq!(provider.store().revision(), before);
        assert_eq!(provider.store().get(&p1).total_invoices, 0);
    }

    #[tokio::test]
    async fn frames_for_other_projects_are_dropped() {
        let provider = provider(ProjectView::default());
        let p1 = ProjectId::from("P1");
        let p2 = ProjectId::from("P2");
        provider.connect(p1.clone());

        let before = provider.store().revision();
        provider.shared.ingest(frame(
            Some(1),
            json!({
                "event": "invoice.created",
                "project_id": "P2",
                "data": {"invoice_number": "INV-1"},
                "canonical_totals": {"total_billed": 5.0},
            }),
        ));
        assert_eq!(provider.store().revision(), before);
        assert!(!provider.store().contains(&p2));

        // The session's own project still goes through.
        provider.shared.ingest(frame(
            Some(1),
            json!({
                "event": "invoice.created",
                "project_id": "P1",
                "data": {"invoice_number": "INV-1"},
                "canonical_totals": {"total_billed": 5.0},
            }),
        ));
        assert_eq!(provider.store().get(&p1).total_invoices, 1);
    }

    #[tokio::test]
    async fn server_event_confirms_pending_invoice() {
        let provider = provider(ProjectView::default());
        let p1 = ProjectId::from("P1");
        let update_id = provider.begin_optimistic(
            &p1,
            OptimisticKind::InvoiceCreate {
                invoice_number: "INV-9".to_string(),
                amount: 100.0,
                ra_tag: None,
            },
        );
        assert_eq!(provider.store().get(&p1).total_invoices, 1);

        provider.shared.ingest(frame(
            None,
            json!({"event": "invoice.created", "project_id": "P1", "data": {"invoice_number": "INV-9", "amount": 100.0}}),
        ));

        let view = provider.store().get(&p1);
        assert_eq!(view.total_invoices, 1);
        assert!(view.pending_invoice.is_none());
        assert!(!provider.optimistic().contains(update_id));
        assert!(provider.resolve_optimistic(update_id, false).is_none());
    }

    #[tokio::test]
    async fn conflicts_are_broadcast_and_garbage_is_dropped() {
        let provider = provider(ProjectView::default());
        let mut conflicts = provider.conflicts();

        provider.shared.ingest(frame(None, json!({"nonsense": true})));
        provider.shared.ingest(Inbound {
            generation: None,
            payload: InboundPayload::Frame("{not json".to_string()),
        });
        provider.shared.ingest(frame(
            None,
            json!({"event": "conflict.detected", "project_id": "P1", "data": {"message": "stale quantity"}}),
        ));

        let notice = conflicts.try_recv().expect("conflict broadcast");
        assert_eq!(notice.message, "stale quantity");
        assert_eq!(provider.store().revision(), 0);
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let provider = provider(ProjectView::default());
        let p1 = ProjectId::from("P1");
        provider.begin_optimistic(
            &p1,
            OptimisticKind::InvoiceDelete {
                invoice_number: "INV-1".to_string(),
            },
        );
        provider.connect(p1.clone());

        provider.shutdown();

        assert!(provider.store().project_ids().is_empty());
        assert!(provider.optimistic().is_empty());
        assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
    }
}
