//! Core engine for flowline.
//!
//! Expression language, workflow schema, step execution and run
//! coordination. Storage and capabilities are reached through traits
//! (`CheckpointStore`, `Capability`) implemented in flowline-infra.

pub mod event;
pub mod expression;
pub mod repository;
pub mod workflow;
