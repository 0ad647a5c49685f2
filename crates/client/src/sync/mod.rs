//! Real-time project sync.
//!
//! This module provides:
//! - A live channel per project with auto-reconnect and transport fallback
//! - Event normalization into canonical store updates
//! - Read-only accessors for presentation code
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  WebSocket   │  │     SSE      │  │   Polling    │
//! │ (preferred)  │  │  (fallback)  │  │ (safety net) │
//! └──────────────┘  └──────────────┘  └──────────────┘
//!         │                 │                 │
//!         └─────────────────┼─────────────────┘
//!                           ▼  generation-tagged inbound queue
//!              ┌─────────────────────────┐
//!              │   reducer (normalizer)  │
//!              └─────────────────────────┘
//!                           │
//!                           ▼
//!              ┌─────────────────────────┐
//!              │      ProjectStore       │◄── OptimisticTracker
//!              └─────────────────────────┘
//!                           │
//!                           ▼
//!                 use_project_data / subscribe
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let provider = ProjectSyncProvider::new(SyncConfig::from_env()?);
//! provider.connect("P1");
//!
//! let mut changes = provider.subscribe();
//! while changes.changed().await.is_ok() {
//!     let project = provider.project_data(&ProjectId::from("P1"));
//!     println!("{} billed", project.data.total_billed);
//! }
//! ```

mod connection;
mod hooks;
mod manager;
pub mod normalizer;

pub use connection::{ConnectionState, ReconnectConfig, SocketHandle};
pub use hooks::{use_connection_state, use_project_data, ProjectData};
pub use manager::ProjectSyncProvider;
pub use normalizer::{normalize, ConflictNotice, Outcome};
