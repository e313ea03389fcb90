//! Node registry — URI-keyed factories for descriptors and processors.
//!
//! A factory produces a per-instance descriptor (some specialise ports from
//! creation parameters, e.g. the event source binding to a named queue) plus
//! the processor box the executor will run. The sink is descriptor-only: its
//! buffers are consumed by `Output` opcodes, never by a processor.

use std::collections::BTreeMap;
use std::sync::Arc;

use conducto_core::{NodeDescriptor, ParamValue, Processor};
use conducto_nodes as nodes;

use crate::error::EngineError;

/// Creation parameters passed to `add_node`.
pub type NodeParams = BTreeMap<String, ParamValue>;

/// What a factory produces for one node instance.
pub struct NodeArtifacts {
    /// Per-instance descriptor.
    pub descriptor: Arc<NodeDescriptor>,
    /// Runtime processor; `None` for descriptor-only nodes (the sink).
    pub processor: Option<Box<dyn Processor>>,
}

type Factory = fn(&NodeParams) -> Result<NodeArtifacts, EngineError>;

/// Registry of node factories, keyed by descriptor URI.
pub struct NodeRegistry {
    entries: BTreeMap<String, Factory>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl NodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with every `builtin://` node registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("builtin://sink", make_sink);
        registry.register("builtin://sine", make_sine);
        registry.register("builtin://dc", make_dc);
        registry.register("builtin://gain", make_gain);
        registry.register("builtin://passthru", make_passthru);
        registry.register("builtin://split", make_split);
        registry.register("builtin://join", make_join);
        registry.register("builtin://wavfile", make_wavfile);
        registry.register("builtin://event_source", make_event_source);
        registry.register("builtin://crasher", make_crasher);
        registry
    }

    /// Register (or replace) a factory.
    pub fn register(&mut self, uri: &str, factory: Factory) {
        self.entries.insert(uri.to_owned(), factory);
    }

    /// Instantiate a node from a URI.
    pub fn create(&self, uri: &str, params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
        let factory = self
            .entries
            .get(uri)
            .ok_or_else(|| EngineError::UnknownDescriptor(uri.to_owned()))?;
        factory(params)
    }

    /// Registered URIs, sorted.
    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn float_param(params: &NodeParams, name: &str, default: f32) -> f32 {
    params
        .get(name)
        .and_then(ParamValue::as_float)
        .unwrap_or(default)
}

fn str_param<'a>(params: &'a NodeParams, name: &str) -> Option<&'a str> {
    params.get(name).and_then(ParamValue::as_str)
}

fn make_sink(_params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::sink::descriptor()),
        processor: None,
    })
}

fn make_sine(params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    let freq = float_param(params, "freq", 440.0);
    let amp = float_param(params, "amp", 0.5);
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::oscillator::descriptor()),
        processor: Some(Box::new(nodes::SineOscillator::new(freq, amp))),
    })
}

fn make_dc(params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    let value = float_param(params, "value", 0.0);
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::dc::descriptor()),
        processor: Some(Box::new(nodes::DcSource::new(value))),
    })
}

fn make_gain(params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    let gain = float_param(params, "gain", 1.0);
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::gain::descriptor()),
        processor: Some(Box::new(nodes::Gain::new(gain))),
    })
}

fn make_passthru(_params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::passthru::descriptor()),
        processor: Some(Box::new(nodes::PassThru)),
    })
}

fn make_split(_params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::split::descriptor()),
        processor: Some(Box::new(nodes::SplitChannels)),
    })
}

fn make_join(_params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::join::descriptor()),
        processor: Some(Box::new(nodes::JoinChannels)),
    })
}

fn make_wavfile(params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    let path = str_param(params, "path")
        .ok_or_else(|| EngineError::SetupFailed("wavfile requires a path parameter".into()))?;
    let looping = float_param(params, "loop", 0.0) >= 0.5;
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::wavfile::descriptor()),
        processor: Some(Box::new(nodes::WavFileSource::new(path, looping))),
    })
}

fn make_event_source(params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    let queue = str_param(params, "queue").unwrap_or("midi");
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::event_source::descriptor(queue)),
        processor: Some(Box::new(nodes::EventSource)),
    })
}

fn make_crasher(params: &NodeParams) -> Result<NodeArtifacts, EngineError> {
    let after = float_param(params, "after_blocks", 0.0).max(0.0) as u64;
    Ok(NodeArtifacts {
        descriptor: Arc::new(nodes::crasher::descriptor()),
        processor: Some(Box::new(nodes::Crasher::new(after))),
    })
}
