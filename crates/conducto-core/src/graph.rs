//! Graph model — node arena, connections, and the mutation API.
//!
//! The graph holds nodes (descriptor + coalesced parameter values + port
//! properties) and connections (typed port pairs). Mutations happen on control
//! threads under the engine's writer lock; the graph itself is plain data and
//! never touched by the audio thread. Compilation reads it through the
//! snapshot iterators.
//!
//! Nodes are addressed by stable integer ids and never hold references to each
//! other; connectivity exists only in the connection list.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::node::{NodeDescriptor, NodeId, NodeKind, ParamKind, ParamValue};
use crate::port::{PortDir, PortRef, PortType};

/// Errors from graph mutations.
///
/// All of these leave the graph unchanged.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The node id is not in the graph.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// The node exists but has no port with this name.
    #[error("node {node} has no port {port:?}")]
    UnknownPort {
        /// Node looked up.
        node: NodeId,
        /// Missing port name.
        port: String,
    },
    /// No such connection to disconnect.
    #[error("no connection {src} -> {dst}")]
    UnknownConnection {
        /// Source end.
        src: PortRef,
        /// Destination end.
        dst: PortRef,
    },
    /// The connection is structurally invalid (direction, typing, duplicate,
    /// fan-in on control, or it would create a cycle).
    #[error("invalid connection: {0}")]
    InvalidConnection(String),
    /// Fan-in connections resolved to differing types on one input port.
    #[error("conflicting connection types on {node}:{port}")]
    TypeConflict {
        /// Destination node.
        node: NodeId,
        /// Destination port.
        port: String,
    },
    /// The node has no parameter with this name.
    #[error("node {node} has no parameter {name:?}")]
    UnknownParameter {
        /// Node looked up.
        node: NodeId,
        /// Missing parameter name.
        name: String,
    },
    /// The parameter exists but the supplied value kind does not match.
    #[error("parameter {name:?} expects a {expected} value")]
    TypeMismatch {
        /// Parameter name.
        name: String,
        /// Expected kind.
        expected: &'static str,
    },
    /// The node cannot be removed (it is the sink).
    #[error("node {0} is busy")]
    NodeBusy(NodeId),
    /// A second sink node was added.
    #[error("graph already has a sink node")]
    DuplicateSink,
}

/// Mutable per-port properties, settable through `set_port_property`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortProps {
    /// Muted output ports compile to silence for all consumers.
    pub muted: bool,
    /// Logical external queue feeding an otherwise unconnected event input
    /// (compiled to a `FetchBuffer` opcode).
    pub stream: Option<String>,
}

/// A node as stored in the graph: descriptor, latest parameter values, and
/// per-port properties.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Stable id.
    pub id: NodeId,
    /// Shared static description.
    pub descriptor: Arc<NodeDescriptor>,
    /// Coalesced parameter values; the latest write wins.
    params: BTreeMap<String, ParamValue>,
    /// Per-port properties, keyed by port name.
    port_props: BTreeMap<String, PortProps>,
}

impl NodeEntry {
    /// Latest value of a parameter.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Properties of a port (defaults if never set).
    pub fn port_props(&self, port: &str) -> PortProps {
        self.port_props.get(port).cloned().unwrap_or_default()
    }
}

/// A directed, typed connection between an output port and an input port.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Source (output) end.
    pub source: PortRef,
    /// Destination (input) end.
    pub dest: PortRef,
    /// Resolved connection type.
    pub ty: PortType,
}

/// The node graph: a node arena plus an ordered connection list and exactly
/// one sink.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, NodeEntry>,
    connections: Vec<Connection>,
    sink: Option<NodeId>,
    next_id: u64,
}

impl Graph {
    /// New empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // --- Node mutations ---

    /// Adds a node and returns its id.
    ///
    /// Sink nodes are limited to one per graph. Port-level stream defaults
    /// from the descriptor are copied into the node's port properties.
    pub fn add_node(&mut self, descriptor: Arc<NodeDescriptor>) -> Result<NodeId, GraphError> {
        if descriptor.kind == NodeKind::Sink && self.sink.is_some() {
            return Err(GraphError::DuplicateSink);
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;

        let mut port_props = BTreeMap::new();
        for port in &descriptor.ports {
            if let Some(stream) = &port.stream {
                port_props.insert(
                    port.name.clone(),
                    PortProps {
                        muted: false,
                        stream: Some(stream.clone()),
                    },
                );
            }
        }

        let entry = NodeEntry {
            id,
            params: descriptor.default_params(),
            port_props,
            descriptor,
        };
        if entry.descriptor.kind == NodeKind::Sink {
            self.sink = Some(id);
        }
        self.nodes.insert(id, entry);
        Ok(id)
    }

    /// Removes a node and every connection touching it.
    ///
    /// The sink cannot be removed while the graph is live.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::UnknownNode(id));
        }
        if self.sink == Some(id) {
            return Err(GraphError::NodeBusy(id));
        }
        self.nodes.remove(&id);
        self.connections
            .retain(|c| c.source.node != id && c.dest.node != id);
        Ok(())
    }

    /// Connects an output port to an input port.
    ///
    /// Fails with `InvalidConnection` when directions mismatch, the ports
    /// share no type, the connection already exists, fan-in lands on a control
    /// input, or the edge would create a cycle. Fan-in with a type differing
    /// from the existing connections fails with `TypeConflict`.
    ///
    /// Returns the resolved connection type.
    pub fn connect_ports(
        &mut self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<PortType, GraphError> {
        let src = self.node(src_node)?;
        let dst = self.node(dst_node)?;

        let src_desc = src
            .descriptor
            .port(src_port)
            .ok_or_else(|| GraphError::UnknownPort {
                node: src_node,
                port: src_port.to_owned(),
            })?;
        let dst_desc = dst
            .descriptor
            .port(dst_port)
            .ok_or_else(|| GraphError::UnknownPort {
                node: dst_node,
                port: dst_port.to_owned(),
            })?;

        if src_desc.dir != PortDir::Output || dst_desc.dir != PortDir::Input {
            return Err(GraphError::InvalidConnection(format!(
                "direction mismatch: {src_node}:{src_port} -> {dst_node}:{dst_port}"
            )));
        }

        let ty = src_desc.resolve_type(dst_desc).ok_or_else(|| {
            GraphError::InvalidConnection(format!(
                "no common type between {src_node}:{src_port} and {dst_node}:{dst_port}"
            ))
        })?;

        let source = PortRef::new(src_node, src_port);
        let dest = PortRef::new(dst_node, dst_port);

        if self
            .connections
            .iter()
            .any(|c| c.source == source && c.dest == dest)
        {
            return Err(GraphError::InvalidConnection(format!(
                "connection {source} -> {dest} already exists"
            )));
        }

        // Fan-in legality against existing connections on the input.
        let existing: Vec<&Connection> = self
            .connections
            .iter()
            .filter(|c| c.dest == dest)
            .collect();
        if !existing.is_empty() {
            if !ty.allows_fan_in() {
                return Err(GraphError::InvalidConnection(format!(
                    "control input {dest} rejects fan-in"
                )));
            }
            if existing.iter().any(|c| c.ty != ty) {
                return Err(GraphError::TypeConflict {
                    node: dst_node,
                    port: dst_port.to_owned(),
                });
            }
        }

        // Cycle check: the new edge src -> dst closes a cycle iff dst already
        // reaches src downstream.
        if self.reaches(dst_node, src_node) {
            return Err(GraphError::InvalidConnection(format!(
                "connection {source} -> {dest} would create a cycle"
            )));
        }

        self.connections.push(Connection { source, dest, ty });
        Ok(ty)
    }

    /// Removes a connection.
    pub fn disconnect_ports(
        &mut self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        let source = PortRef::new(src_node, src_port);
        let dest = PortRef::new(dst_node, dst_port);
        let before = self.connections.len();
        self.connections
            .retain(|c| !(c.source == source && c.dest == dest));
        if self.connections.len() == before {
            return Err(GraphError::UnknownConnection {
                src: source,
                dst: dest,
            });
        }
        Ok(())
    }

    /// Sets a parameter; the latest value wins.
    ///
    /// Float values are clamped to the declared range.
    pub fn set_parameter(
        &mut self,
        id: NodeId,
        name: &str,
        value: ParamValue,
    ) -> Result<ParamValue, GraphError> {
        let entry = self
            .nodes
            .get_mut(&id)
            .ok_or(GraphError::UnknownNode(id))?;
        let spec = entry
            .descriptor
            .param(name)
            .ok_or_else(|| GraphError::UnknownParameter {
                node: id,
                name: name.to_owned(),
            })?;

        let stored = match (spec.kind, value) {
            (ParamKind::Float, ParamValue::Float(v)) => {
                ParamValue::Float(v.clamp(spec.min, spec.max))
            }
            (ParamKind::Bytes, ParamValue::Bytes(b)) => ParamValue::Bytes(b),
            (ParamKind::Float, ParamValue::Bytes(_)) => {
                return Err(GraphError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "float",
                });
            }
            (ParamKind::Bytes, ParamValue::Float(_)) => {
                return Err(GraphError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "bytes",
                });
            }
        };
        entry.params.insert(name.to_owned(), stored.clone());
        Ok(stored)
    }

    /// Updates a port's properties (merge semantics: `None` leaves a field).
    pub fn set_port_property(
        &mut self,
        id: NodeId,
        port: &str,
        muted: Option<bool>,
        stream: Option<Option<String>>,
    ) -> Result<(), GraphError> {
        let entry = self
            .nodes
            .get_mut(&id)
            .ok_or(GraphError::UnknownNode(id))?;
        if entry.descriptor.port(port).is_none() {
            return Err(GraphError::UnknownPort {
                node: id,
                port: port.to_owned(),
            });
        }
        let props = entry.port_props.entry(port.to_owned()).or_default();
        if let Some(m) = muted {
            props.muted = m;
        }
        if let Some(s) = stream {
            props.stream = s;
        }
        Ok(())
    }

    // --- Queries / snapshots ---

    /// Looks up a node.
    pub fn find_node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    /// The sink node, if one exists.
    pub fn sink(&self) -> Option<NodeId> {
        self.sink
    }

    /// Snapshot iteration over nodes, sorted by id.
    pub fn iter_nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Snapshot iteration over connections, in creation order.
    pub fn iter_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Incoming connections of one input port, in creation order.
    pub fn incoming(&self, node: NodeId, port: &str) -> impl Iterator<Item = &Connection> {
        self.connections
            .iter()
            .filter(move |c| c.dest.node == node && c.dest.port == port)
    }

    // --- Internal helpers ---

    fn node(&self, id: NodeId) -> Result<&NodeEntry, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    /// DFS downstream reachability over the connection list.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut visited = std::collections::BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for conn in &self.connections {
                if conn.source.node == current {
                    stack.push(conn.dest.node);
                }
            }
        }
        false
    }
}
