//! Port types and descriptors.
//!
//! Ports are the only way nodes relate to each other: a node declares ordered,
//! named input and output ports, and connections pair an output port with an
//! input port. Each port advertises the buffer types it can carry; when two
//! ports are connected the highest-priority type supported by both sides wins.

use crate::node::NodeId;

/// The kind of data flowing through a port.
///
/// Variants are listed in connection-priority order: when two ports share more
/// than one supported type, the highest-priority shared type is used for the
/// connection (audio > arate control > krate control > events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    /// Two interleaved-free (planar) channels of `block_size` f32 samples.
    AudioStereo,
    /// One channel of `block_size` f32 samples.
    AudioMono,
    /// Audio-rate control signal: `block_size` f32 samples.
    ControlArate,
    /// Control-rate signal: a single f32 per block.
    ControlKrate,
    /// Bounded, offset-ordered sequence of timestamped events.
    Event,
}

impl PortType {
    /// Connection-resolution priority; higher wins.
    pub fn priority(self) -> u8 {
        match self {
            PortType::AudioStereo => 5,
            PortType::AudioMono => 4,
            PortType::ControlArate => 3,
            PortType::ControlKrate => 2,
            PortType::Event => 1,
        }
    }

    /// Whether fan-in on an input port of this type is meaningful.
    ///
    /// Audio fan-in sums, event fan-in merges by offset; control inputs reject
    /// fan-in outright.
    pub fn allows_fan_in(self) -> bool {
        matches!(
            self,
            PortType::AudioStereo | PortType::AudioMono | PortType::Event
        )
    }

    /// Number of audio channels carried, or 0 for non-audio types.
    pub fn channels(self) -> usize {
        match self {
            PortType::AudioStereo => 2,
            PortType::AudioMono => 1,
            _ => 0,
        }
    }

    /// Stable lowercase name, used in observer records and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            PortType::AudioStereo => "audio-stereo",
            PortType::AudioMono => "audio-mono",
            PortType::ControlArate => "control-arate",
            PortType::ControlKrate => "control-krate",
            PortType::Event => "event",
        }
    }
}

/// Direction of a port relative to its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    /// The node reads from this port.
    Input,
    /// The node writes to this port.
    Output,
}

/// Declared shape of a single port on a node descriptor.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    /// Port name, unique within the node (e.g. `"out:left"`).
    pub name: String,
    /// Input or output.
    pub dir: PortDir,
    /// Supported types in descending priority order. Must be non-empty.
    pub types: Vec<PortType>,
    /// Default logical stream name for externally-fed input ports.
    ///
    /// Copied into the node's port properties at graph insertion; compiled
    /// into a `FetchBuffer` opcode when the port is otherwise unconnected.
    pub stream: Option<String>,
}

impl PortDescriptor {
    /// A single-type input port.
    pub fn input(name: impl Into<String>, ty: PortType) -> Self {
        Self {
            name: name.into(),
            dir: PortDir::Input,
            types: vec![ty],
            stream: None,
        }
    }

    /// A single-type output port.
    pub fn output(name: impl Into<String>, ty: PortType) -> Self {
        Self {
            name: name.into(),
            dir: PortDir::Output,
            types: vec![ty],
            stream: None,
        }
    }

    /// An event input port fed from a named external queue.
    pub fn event_input_stream(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: PortDir::Input,
            types: vec![PortType::Event],
            stream: Some(queue.into()),
        }
    }

    /// Primary (highest-priority) supported type.
    pub fn primary_type(&self) -> PortType {
        self.types[0]
    }

    /// Resolve the preferred connection type against another descriptor.
    ///
    /// Returns the highest-priority type present in both supported sets, or
    /// `None` when the ports share no type.
    pub fn resolve_type(&self, other: &PortDescriptor) -> Option<PortType> {
        self.types
            .iter()
            .filter(|t| other.types.contains(t))
            .copied()
            .max_by_key(|t| t.priority())
    }
}

/// A (node, port name) pair identifying one end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    /// Owning node.
    pub node: NodeId,
    /// Port name on that node.
    pub port: String,
}

impl PortRef {
    /// Convenience constructor.
    pub fn new(node: NodeId, port: impl Into<String>) -> Self {
        Self {
            node,
            port: port.into(),
        }
    }
}

impl core::fmt::Display for PortRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}
