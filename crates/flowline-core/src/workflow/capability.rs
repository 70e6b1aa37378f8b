//! External capability ports invoked by callable and agent steps.
//!
//! The engine treats a capability as opaque: it hands over a name and a
//! structured argument value and stores whatever comes back as the step's
//! output. Handlers are registered once in a `HandlerMap` when the run
//! coordinator is built and shared read-only afterwards.
//!
//! Follows the same blanket-impl pattern as the other object-safe wrappers:
//! 1. `Capability` uses RPITIT for `invoke`
//! 2. `CapabilityDyn` is the object-safe twin with boxed futures
//! 3. `BoxCapability` wraps `Arc<dyn CapabilityDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

// ---------------------------------------------------------------------------
// CapabilityError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    /// No handler is registered under this name.
    #[error("no {kind} handler registered for '{name}'")]
    NotFound { kind: &'static str, name: String },

    /// The capability ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The capability could not be reached.
    #[error("transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// An async `invoke(name, args) -> result` capability.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait Capability: Send + Sync {
    fn invoke(
        &self,
        name: &str,
        args: Value,
    ) -> impl Future<Output = Result<Value, CapabilityError>> + Send;
}

/// Object-safe version of [`Capability`] with boxed futures.
pub trait CapabilityDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        name: &'a str,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>>;
}

impl<T: Capability> CapabilityDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        name: &'a str,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>> {
        Box::pin(self.invoke(name, args))
    }
}

/// Type-erased, cheaply cloneable capability.
#[derive(Clone)]
pub struct BoxCapability {
    inner: Arc<dyn CapabilityDyn>,
}

impl BoxCapability {
    pub fn new<T: Capability + 'static>(capability: T) -> Self {
        Self {
            inner: Arc::new(capability),
        }
    }

    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        self.inner.invoke_boxed(name, args).await
    }
}

impl std::fmt::Debug for BoxCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapability").finish_non_exhaustive()
    }
}

/// A capability backed by an async closure over the arguments.
pub struct FnCapability<F>(F);

/// Wrap `f` as a capability. The invoked name is ignored.
pub fn from_fn<F, Fut>(f: F) -> FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    FnCapability(f)
}

impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    fn invoke(
        &self,
        _name: &str,
        args: Value,
    ) -> impl Future<Output = Result<Value, CapabilityError>> + Send {
        (self.0)(args)
    }
}

// ---------------------------------------------------------------------------
// HandlerMap
// ---------------------------------------------------------------------------

/// Named callable and agent handlers, with optional catch-all fallbacks.
#[derive(Debug, Clone, Default)]
pub struct HandlerMap {
    callables: HashMap<String, BoxCapability>,
    agents: HashMap<String, BoxCapability>,
    default_callable: Option<BoxCapability>,
    default_agent: Option<BoxCapability>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_callable<T: Capability + 'static>(mut self, name: &str, capability: T) -> Self {
        self.callables
            .insert(name.to_string(), BoxCapability::new(capability));
        self
    }

    pub fn register_agent<T: Capability + 'static>(mut self, name: &str, capability: T) -> Self {
        self.agents
            .insert(name.to_string(), BoxCapability::new(capability));
        self
    }

    /// Handle every callable name that has no explicit registration.
    pub fn with_default_callable(mut self, capability: BoxCapability) -> Self {
        self.default_callable = Some(capability);
        self
    }

    /// Handle every agent name that has no explicit registration.
    pub fn with_default_agent(mut self, capability: BoxCapability) -> Self {
        self.default_agent = Some(capability);
        self
    }

    pub fn callable(&self, name: &str) -> Result<&BoxCapability, CapabilityError> {
        self.callables
            .get(name)
            .or(self.default_callable.as_ref())
            .ok_or_else(|| CapabilityError::NotFound {
                kind: "callable",
                name: name.to_string(),
            })
    }

    pub fn agent(&self, name: &str) -> Result<&BoxCapability, CapabilityError> {
        self.agents
            .get(name)
            .or(self.default_agent.as_ref())
            .ok_or_else(|| CapabilityError::NotFound {
                kind: "agent",
                name: name.to_string(),
            })
    }

    pub fn callable_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
