//! SQLite checkpoint storage.
//!
//! `DatabasePool` splits a WAL-mode database into a multi-connection reader
//! pool and a single-connection writer pool.

pub mod checkpoint;
pub mod pool;
