//! Infrastructure layer for flowline.
//!
//! Implements the ports defined in `flowline-core`: filesystem and SQLite
//! checkpoint stores, HTTP and builtin capabilities, and `config.toml`
//! loading.

pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod sqlite;
