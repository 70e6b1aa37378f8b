//! Capability adapters: builtin local callables and an HTTP bridge.

pub mod builtin;
pub mod http;

use std::time::Duration;

use flowline_core::workflow::{BoxCapability, CapabilityError, HandlerMap};
use flowline_types::config::CapabilityConfig;

pub use builtin::BuiltinCallables;
pub use http::HttpCapability;

/// Build the handler map for a process: builtin callables, plus HTTP
/// fallbacks for any configured endpoints.
pub fn handler_map(config: &CapabilityConfig) -> Result<HandlerMap, CapabilityError> {
    let mut handlers = builtin::register_builtins(HandlerMap::new());
    let timeout = Duration::from_secs(config.request_timeout_secs);

    if let Some(endpoint) = &config.callable_endpoint {
        tracing::debug!(endpoint = endpoint.as_str(), "remote callables enabled");
        handlers = handlers.with_default_callable(BoxCapability::new(HttpCapability::new(endpoint, timeout)?));
    }
    if let Some(endpoint) = &config.agent_endpoint {
        tracing::debug!(endpoint = endpoint.as_str(), "remote agents enabled");
        handlers = handlers.with_default_agent(BoxCapability::new(HttpCapability::new(endpoint, timeout)?));
    }
    Ok(handlers)
}
