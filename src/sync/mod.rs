//! Drift detection and repair between service records and provider state

pub mod matching;
pub mod reconciler;

pub use reconciler::{reconcile, Inventory, SyncMode, SyncService, SyncSummary};
