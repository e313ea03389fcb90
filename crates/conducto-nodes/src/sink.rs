//! The terminal sink node.
//!
//! The sink has no processor: the compiler turns its input bindings directly
//! into `Output` opcodes the backend consumes. Only its descriptor exists.

use conducto_core::{NodeDescriptor, NodeKind, PortDescriptor, PortType};

/// Descriptor for `builtin://sink`: stereo-paired mono inputs.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://sink".into(),
        kind: NodeKind::Sink,
        ports: vec![
            PortDescriptor::input("in:left", PortType::AudioMono),
            PortDescriptor::input("in:right", PortType::AudioMono),
        ],
        params: vec![],
        latency: 0,
    }
}
