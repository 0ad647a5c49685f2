//! Read-only accessors for presentation code.
//!
//! Consumers never see raw events. They read the project's current view
//! plus a few connection flags, and re-read whenever
//! [`ProjectSyncProvider::subscribe`] wakes them.

use std::sync::Arc;

use billsync_shared::{ProjectId, ProjectView};

use super::connection::ConnectionState;
use super::manager::ProjectSyncProvider;

/// Everything a billing screen needs for one project.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectData {
    pub project_id: ProjectId,
    pub data: Arc<ProjectView>,
    pub connection_state: ConnectionState,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_reconnecting: bool,
    pub has_error: bool,
}

/// Current view and connection flags for `project_id`.
///
/// Connection flags describe the live channel only when `project_id` is the
/// provider's current project; any other project reads as disconnected.
pub fn use_project_data(provider: &ProjectSyncProvider, project_id: &ProjectId) -> ProjectData {
    let connection_state = use_connection_state(provider, project_id);
    ProjectData {
        project_id: project_id.clone(),
        data: provider.store().get(project_id),
        is_connected: connection_state.is_connected(),
        is_connecting: connection_state.is_connecting(),
        is_reconnecting: connection_state.is_reconnecting(),
        has_error: connection_state.has_error(),
        connection_state,
    }
}

/// Connection state as seen from `project_id`.
pub fn use_connection_state(provider: &ProjectSyncProvider, project_id: &ProjectId) -> ConnectionState {
    if provider.current_project().as_ref() == Some(project_id) {
        provider.connection_state()
    } else {
        ConnectionState::Disconnected
    }
}

impl ProjectSyncProvider {
    pub fn project_data(&self, project_id: &ProjectId) -> ProjectData {
        use_project_data(self, project_id)
    }
}
