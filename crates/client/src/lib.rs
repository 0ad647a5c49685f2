//! Billsync client - real-time project billing sync
//!
//! This crate keeps a cached billing view of a project current over a live
//! channel to the billing backend (WebSocket, SSE or polling), and lets the
//! UI layer show speculative changes before the server confirms them.

pub mod api_client;
pub mod config;
pub mod error;
pub mod logging;
pub mod stores;
pub mod sync;

pub use api_client::{ApiClient, SnapshotSource};
pub use config::{SyncConfig, TransportMode};
pub use error::SyncError;
pub use stores::{OptimisticKind, OptimisticUpdate, ProjectStore, UpdateStatus};
pub use sync::{
    use_project_data, ConflictNotice, ConnectionState, ProjectData, ProjectSyncProvider,
    ReconnectConfig,
};
