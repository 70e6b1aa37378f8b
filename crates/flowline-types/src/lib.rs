//! Shared domain types for flowline.
//!
//! Workflow documents, run results, checkpoint snapshots, lifecycle events,
//! and configuration. Only serde, uuid, chrono and thiserror; no I/O.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
