//! Run context: inputs, layered step outputs, and the loop-frame stack.
//!
//! `RunContext` is the mutable state threaded through one run. Step outputs
//! live in layers: the bottom layer holds top-level steps, and each branch
//! body or loop iteration pushes its own layer. Lookups walk from the
//! innermost layer outward, so nested steps see their earlier siblings and
//! everything visible to their enclosing step.
//!
//! Inputs and layers are `Arc`-backed and copied on write, so handing a
//! read-only view to a parallel loop iteration is cheap.

use std::collections::BTreeMap;
use std::sync::Arc;

use flowline_types::checkpoint::ContextSnapshot;
use serde_json::Value;

use crate::expression::{EvalScope, LoopFrame};

type Layer = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    inputs: Arc<BTreeMap<String, Value>>,
    layers: Vec<Arc<Layer>>,
    frames: Vec<LoopFrame>,
    metadata: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(inputs: BTreeMap<String, Value>) -> Self {
        Self {
            inputs: Arc::new(inputs),
            layers: vec![Arc::new(Layer::new())],
            frames: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Rebuild a top-level context from a checkpoint snapshot.
    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            inputs: Arc::new(snapshot.inputs),
            layers: vec![Arc::new(snapshot.step_outputs)],
            frames: Vec::new(),
            metadata: snapshot.metadata,
        }
    }

    /// Serializable copy of the top-level state.
    ///
    /// Nested layers and loop frames are transient and never snapshotted;
    /// checkpoints are only taken between top-level steps.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            inputs: self.inputs.as_ref().clone(),
            step_outputs: self.step_outputs().clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// A fresh context for a subworkflow: only the given inputs, no outputs.
    pub fn fork(&self, inputs: BTreeMap<String, Value>) -> Self {
        Self {
            inputs: Arc::new(inputs),
            layers: vec![Arc::new(Layer::new())],
            frames: Vec::new(),
            metadata: self.metadata.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Inputs and metadata
    // -----------------------------------------------------------------------

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    // -----------------------------------------------------------------------
    // Step outputs
    // -----------------------------------------------------------------------

    /// Outputs of top-level steps.
    pub fn step_outputs(&self) -> &Layer {
        // The bottom layer is created in every constructor and never popped.
        static EMPTY: Layer = Layer::new();
        self.layers.first().map(|l| l.as_ref()).unwrap_or(&EMPTY)
    }

    /// Record a step output in the innermost layer.
    pub fn set_output(&mut self, name: impl Into<String>, output: Value) {
        if let Some(layer) = self.layers.last_mut() {
            Arc::make_mut(layer).insert(name.into(), output);
        }
    }

    /// Look up a visible step output, innermost layer first.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(name))
    }

    pub fn push_layer(&mut self) {
        self.layers.push(Arc::new(Layer::new()));
    }

    /// Pop the innermost layer and return the outputs recorded in it.
    ///
    /// The bottom layer is never popped; calling this at top level returns
    /// an empty map.
    pub fn pop_layer(&mut self) -> Layer {
        if self.layers.len() <= 1 {
            return Layer::new();
        }
        self.layers
            .pop()
            .map(Arc::unwrap_or_clone)
            .unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    // -----------------------------------------------------------------------
    // Loop frames
    // -----------------------------------------------------------------------

    pub fn push_frame(&mut self, frame: LoopFrame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<LoopFrame> {
        self.frames.pop()
    }
}

impl EvalScope for RunContext {
    fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    fn step_output(&self, id: &str) -> Option<&Value> {
        self.output(id)
    }

    fn loop_frame(&self) -> Option<&LoopFrame> {
        self.frames.last()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
