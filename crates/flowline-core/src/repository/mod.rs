//! Storage port definitions.
//!
//! The infrastructure crate (flowline-infra) implements these traits for
//! the filesystem and SQLite. Core never depends on a storage technology.

pub mod checkpoint;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
