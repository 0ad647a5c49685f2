//! Stores for cached project state.

pub mod optimistic;
pub mod projects;

pub use optimistic::{OptimisticKind, OptimisticTracker, OptimisticUpdate, UpdateStatus};
pub use projects::{ProjectPatch, ProjectStore, StoreUpdate};
