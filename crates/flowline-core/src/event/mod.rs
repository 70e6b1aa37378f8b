//! Run lifecycle event distribution.
//!
//! Provides an `EventBus` that fans `RunEvent` messages out to every
//! subscriber over a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
