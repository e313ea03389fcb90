//! Node identity, descriptors, parameters, and the processor capability trait.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::buffer::PortIo;
use crate::context::BlockContext;
use crate::port::{PortDescriptor, PortDir};

/// Unique identifier for a node in the graph.
///
/// Ids are assigned sequentially and never reused within an engine instance.
/// They remain stable across graph mutations and program compilations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Construct from a raw id (observer replay, tests).
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric identifier.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Classification of a node's role in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Produces audio or control signal from nothing (oscillator, file player).
    Source,
    /// The distinguished terminal node whose inputs feed the backend.
    Sink,
    /// Transforms inputs into outputs.
    Filter,
    /// Produces events (MIDI queue, track event stream).
    EventSource,
    /// Hosts an external plugin instance.
    PluginHost,
}

/// Value kind a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A single f32, clamped to the declared range.
    Float,
    /// Opaque bytes (paths, blobs). Delivered over the update channel.
    Bytes,
}

/// Declared shape of one node parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Parameter name, unique within the node.
    pub name: String,
    /// Accepted value kind.
    pub kind: ParamKind,
    /// Lower bound for float parameters.
    pub min: f32,
    /// Upper bound for float parameters.
    pub max: f32,
    /// Default float value.
    pub default: f32,
}

impl ParamSpec {
    /// A float parameter with range and default.
    pub fn float(name: impl Into<String>, min: f32, max: f32, default: f32) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Float,
            min,
            max,
            default: default.clamp(min, max),
        }
    }

    /// A bytes parameter (path, blob).
    pub fn bytes(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Bytes,
            min: 0.0,
            max: 0.0,
            default: 0.0,
        }
    }
}

/// A parameter value as carried by control-surface operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Float value.
    Float(f32),
    /// Byte-string value.
    Bytes(Vec<u8>),
}

impl ParamValue {
    /// The float inside, if this is a float value.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bytes(_) => None,
        }
    }

    /// The bytes inside interpreted as UTF-8, if this is a bytes value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Bytes(b) => core::str::from_utf8(b).ok(),
            ParamValue::Float(_) => None,
        }
    }
}

/// Static description of a node type: identity, classification, ports,
/// parameters, and a latency hint.
///
/// Descriptors are produced per-instance by the node registry (a factory may
/// specialise ports from creation parameters, e.g. an event source binding to
/// a named queue) and shared between the graph model and observers.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    /// Factory URI this node was created from (e.g. `"builtin://sine"`).
    pub uri: String,
    /// Role classification.
    pub kind: NodeKind,
    /// Ordered port declarations; names unique within the node.
    pub ports: Vec<PortDescriptor>,
    /// Declared parameters.
    pub params: Vec<ParamSpec>,
    /// Declared processing latency in frames.
    pub latency: usize,
}

impl NodeDescriptor {
    /// Look up a port by name.
    pub fn port(&self, name: &str) -> Option<&PortDescriptor> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Ordered input ports.
    pub fn input_ports(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.ports.iter().filter(|p| p.dir == PortDir::Input)
    }

    /// Ordered output ports.
    pub fn output_ports(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.ports.iter().filter(|p| p.dir == PortDir::Output)
    }

    /// Look up a parameter spec by name.
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Default parameter map for a fresh node instance.
    pub fn default_params(&self) -> BTreeMap<String, ParamValue> {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Float)
            .map(|p| (p.name.clone(), ParamValue::Float(p.default)))
            .collect()
    }
}

/// Errors raised by processor implementations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Resource acquisition during `setup` failed.
    #[error("setup failed: {0}")]
    Setup(String),
    /// `process_block` failed; the executor quarantines the node.
    #[error("processing failed: {0}")]
    Process(String),
    /// The node does not know this parameter.
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    /// The parameter exists but the value kind is wrong.
    #[error("parameter {0} received the wrong value kind")]
    TypeMismatch(String),
}

/// The capability interface every runtime node implements.
///
/// Dynamic dispatch is confined to the executor's `CallNode` path; everything
/// else in the engine works on descriptors and ids.
///
/// Lifecycle: `setup` runs on a control thread before the node enters the
/// graph and may allocate plugin resources; `process_block` runs on the audio
/// thread once per block; `cleanup` runs on a control thread after removal and
/// must be idempotent.
pub trait Processor: Send {
    /// Acquire resources. Runs off the audio thread.
    fn setup(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Process one block. Buffers are reached through `io` using the node's
    /// declared port order. Returning an error quarantines the node.
    fn process_block(
        &mut self,
        ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError>;

    /// Apply a coalesced parameter update. Runs on the audio thread at block
    /// start; must not allocate or block.
    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError>;

    /// Release resources. Runs off the audio thread; idempotent.
    fn cleanup(&mut self) {}
}
