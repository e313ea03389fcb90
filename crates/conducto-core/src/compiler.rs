//! Graph → program compilation.
//!
//! Compilation is a pure function of the graph snapshot and the host
//! parameters: validate, topologically order (Kahn, ties broken by node id),
//! resolve port types, bind ports to arena buffers, and emit the flat opcode
//! list. Equal snapshots always produce identical programs, which the
//! determinism tests rely on.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::buffer::{BufferKind, BufferSpec};
use crate::graph::Graph;
use crate::node::{NodeId, NodeKind};
use crate::port::PortType;
use crate::program::{BufferLayout, Opcode, Program};

/// Host-side parameters a program is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostParams {
    /// Frames per block.
    pub block_size: usize,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for HostParams {
    fn default() -> Self {
        Self {
            block_size: 256,
            sample_rate: 44100,
        }
    }
}

/// Errors from compilation.
///
/// These indicate a graph that should never have been committed (mutations
/// pre-validate); the engine treats them as fatal.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Structural validation failed (no sink, cycle, bad sink ports).
    #[error("graph invalid: {0}")]
    Invalid(String),
    /// Fan-in connections of differing types on one input port.
    #[error("conflicting connection types on {node}:{port}")]
    TypeConflict {
        /// Destination node.
        node: NodeId,
        /// Destination port.
        port: String,
    },
}

fn buffer_kind(ty: PortType) -> BufferKind {
    match ty {
        PortType::AudioStereo => BufferKind::Audio { channels: 2 },
        PortType::AudioMono => BufferKind::Audio { channels: 1 },
        PortType::ControlArate => BufferKind::ControlArate,
        PortType::ControlKrate => BufferKind::ControlKrate,
        PortType::Event => BufferKind::Event,
    }
}

/// Compiles a graph snapshot into a [`Program`] with the given generation.
///
/// The generation is supplied by the caller (the control surface passes the
/// previous generation plus one) so that compilation itself stays a pure
/// function: compiling the same snapshot with the same generation twice
/// yields an identical program.
pub fn compile(
    graph: &Graph,
    host: &HostParams,
    generation: u64,
) -> Result<Program, CompileError> {
    // 1. Validate: sink present. Acyclicity falls out of the Kahn sort below.
    let sink = graph
        .sink()
        .ok_or_else(|| CompileError::Invalid("graph has no sink node".into()))?;

    // 2. Topological order, ties broken by node id.
    let order = kahn_order(graph)?;

    let mut layout = BufferLayout::default();
    let mut symbols: BTreeMap<(NodeId, String), usize> = BTreeMap::new();
    let mut alloc = |layout: &mut BufferLayout, kind: BufferKind| -> usize {
        layout.specs.push(BufferSpec { kind });
        layout.specs.len() - 1
    };

    // 3 + 4a. Port typing and producer buffer allocation: one buffer per
    // output port. Fan-out consumers of one port must agree on the resolved
    // type, otherwise the producer cannot be bound to a single buffer.
    for &id in &order {
        let entry = graph.find_node(id).expect("ordered node exists");
        for port in entry.descriptor.output_ports() {
            let mut resolved: Option<PortType> = None;
            for conn in graph.iter_connections() {
                if conn.source.node == id && conn.source.port == port.name {
                    match resolved {
                        None => resolved = Some(conn.ty),
                        Some(ty) if ty != conn.ty => {
                            return Err(CompileError::TypeConflict {
                                node: id,
                                port: port.name.clone(),
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
            let ty = resolved.unwrap_or_else(|| port.primary_type());
            let idx = alloc(&mut layout, buffer_kind(ty));
            symbols.insert((id, port.name.clone()), idx);
        }
    }

    // 4b + 5. Input binding and opcode emission, in topological order.
    let mut opcodes = Vec::new();
    for &id in &order {
        let entry = graph.find_node(id).expect("ordered node exists");
        let desc = &entry.descriptor;

        let mut input_bufs = Vec::new();
        for port in desc.input_ports() {
            // Fan-in sources in connection creation order; re-check typing.
            let mut ty: Option<PortType> = None;
            let mut sources = Vec::new();
            for conn in graph.incoming(id, &port.name) {
                match ty {
                    None => ty = Some(conn.ty),
                    Some(t) if t != conn.ty => {
                        return Err(CompileError::TypeConflict {
                            node: id,
                            port: port.name.clone(),
                        });
                    }
                    Some(_) => {}
                }
                let buf = symbols[&(conn.source.node, conn.source.port.clone())];
                sources.push(buf);
            }

            let props = entry.port_props(&port.name);
            let buf = match sources.len() {
                0 => {
                    // Externally-fed event inputs compile to a fetch; every
                    // other unconnected input gets a buffer zeroed per block.
                    let kind = buffer_kind(port.primary_type());
                    let idx = alloc(&mut layout, kind);
                    if port.primary_type() == PortType::Event && props.stream.is_some() {
                        opcodes.push(Opcode::FetchBuffer {
                            queue: props.stream.clone().expect("stream checked above"),
                            buf: idx,
                        });
                    } else {
                        opcodes.push(Opcode::Clear { buf: idx });
                    }
                    idx
                }
                1 => sources[0],
                _ => {
                    let ty = ty.expect("fan-in implies at least one connection");
                    let idx = alloc(&mut layout, buffer_kind(ty));
                    opcodes.push(Opcode::Clear { buf: idx });
                    for src in sources {
                        if ty == PortType::Event {
                            opcodes.push(Opcode::MergeEvents { src, dst: idx });
                        } else {
                            opcodes.push(Opcode::Mix { src, dst: idx });
                        }
                    }
                    idx
                }
            };
            symbols.insert((id, port.name.clone()), buf);
            input_bufs.push(buf);
        }

        if desc.kind != NodeKind::Sink {
            let output_bufs: Vec<usize> = desc
                .output_ports()
                .map(|p| symbols[&(id, p.name.clone())])
                .collect();
            opcodes.push(Opcode::CallNode {
                node: id,
                inputs: input_bufs,
                outputs: output_bufs,
            });

            // Muted outputs compile to silence for every consumer.
            for port in desc.output_ports() {
                if entry.port_props(&port.name).muted {
                    opcodes.push(Opcode::Clear {
                        buf: symbols[&(id, port.name.clone())],
                    });
                }
            }
        }
    }

    // 6. Sink copy: one Output per sink input channel.
    let sink_entry = graph.find_node(sink).expect("sink exists");
    let mut channel = 0;
    for port in sink_entry.descriptor.input_ports() {
        if port.primary_type() != PortType::AudioMono {
            return Err(CompileError::Invalid(format!(
                "sink port {} must be mono audio",
                port.name
            )));
        }
        opcodes.push(Opcode::Output {
            channel,
            buf: symbols[&(sink, port.name.clone())],
        });
        channel += 1;
    }

    Ok(Program {
        generation,
        block_size: host.block_size,
        sample_rate: host.sample_rate,
        sink,
        opcodes,
        layout,
        symbols,
    })
}

/// Kahn's algorithm over the connection list; ready nodes are drained in
/// ascending id order so compilations are deterministic.
fn kahn_order(graph: &Graph) -> Result<Vec<NodeId>, CompileError> {
    let mut in_degree: BTreeMap<NodeId, usize> =
        graph.iter_nodes().map(|n| (n.id, 0)).collect();
    for conn in graph.iter_connections() {
        if let Some(d) = in_degree.get_mut(&conn.dest.node) {
            *d += 1;
        }
    }

    let mut ready: std::collections::BTreeSet<NodeId> = in_degree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(&id) = ready.iter().next() {
        ready.remove(&id);
        order.push(id);
        for conn in graph.iter_connections() {
            if conn.source.node == id
                && let Some(d) = in_degree.get_mut(&conn.dest.node)
            {
                *d -= 1;
                if *d == 0 {
                    ready.insert(conn.dest.node);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        return Err(CompileError::Invalid("graph contains a cycle".into()));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeDescriptor, ParamSpec, ParamValue};
    use crate::port::PortDescriptor;
    use std::sync::Arc;

    fn source_desc() -> Arc<NodeDescriptor> {
        Arc::new(NodeDescriptor {
            uri: "builtin://sine".into(),
            kind: NodeKind::Source,
            ports: vec![
                PortDescriptor::output("out:left", PortType::AudioMono),
                PortDescriptor::output("out:right", PortType::AudioMono),
            ],
            params: vec![ParamSpec::float("freq", 1.0, 20000.0, 440.0)],
            latency: 0,
        })
    }

    fn gain_desc() -> Arc<NodeDescriptor> {
        Arc::new(NodeDescriptor {
            uri: "builtin://gain".into(),
            kind: NodeKind::Filter,
            ports: vec![
                PortDescriptor::input("in", PortType::AudioMono),
                PortDescriptor::output("out", PortType::AudioMono),
            ],
            params: vec![ParamSpec::float("gain", 0.0, 4.0, 1.0)],
            latency: 0,
        })
    }

    fn sink_desc() -> Arc<NodeDescriptor> {
        Arc::new(NodeDescriptor {
            uri: "builtin://sink".into(),
            kind: NodeKind::Sink,
            ports: vec![
                PortDescriptor::input("in:left", PortType::AudioMono),
                PortDescriptor::input("in:right", PortType::AudioMono),
            ],
            params: vec![],
            latency: 0,
        })
    }

    fn host() -> HostParams {
        HostParams {
            block_size: 128,
            sample_rate: 44100,
        }
    }

    #[test]
    fn no_sink_fails() {
        let mut g = Graph::new();
        g.add_node(source_desc()).unwrap();
        assert!(matches!(
            compile(&g, &host(), 1),
            Err(CompileError::Invalid(_))
        ));
    }

    #[test]
    fn passthrough_compiles_with_aliased_bindings() {
        let mut g = Graph::new();
        let src = g.add_node(source_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out:left", sink, "in:left").unwrap();
        g.connect_ports(src, "out:right", sink, "in:right").unwrap();

        let p = compile(&g, &host(), 1).unwrap();

        // Sink inputs alias the producer buffers directly.
        assert_eq!(p.binding(sink, "in:left"), p.binding(src, "out:left"));
        assert_eq!(p.binding(sink, "in:right"), p.binding(src, "out:right"));

        // One CallNode (sink gets none) and two Outputs.
        let calls = p
            .opcodes
            .iter()
            .filter(|o| matches!(o, Opcode::CallNode { .. }))
            .count();
        assert_eq!(calls, 1);
        let outputs: Vec<_> = p
            .opcodes
            .iter()
            .filter_map(|o| match o {
                Opcode::Output { channel, buf } => Some((*channel, *buf)),
                _ => None,
            })
            .collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].0, 0);
        assert_eq!(outputs[1].0, 1);
    }

    #[test]
    fn fan_in_emits_clear_then_mix() {
        let mut g = Graph::new();
        let s1 = g.add_node(source_desc()).unwrap();
        let s2 = g.add_node(source_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(s1, "out:left", sink, "in:left").unwrap();
        g.connect_ports(s2, "out:left", sink, "in:left").unwrap();
        g.connect_ports(s1, "out:right", sink, "in:right").unwrap();

        let p = compile(&g, &host(), 1).unwrap();

        let mix_buf = p.binding(sink, "in:left").unwrap();
        // Dedicated fan-in buffer, distinct from both producers.
        assert_ne!(Some(mix_buf), p.binding(s1, "out:left"));
        assert_ne!(Some(mix_buf), p.binding(s2, "out:left"));

        // Clear precedes the two Mix ops targeting the fan-in buffer.
        let clear_pos = p
            .opcodes
            .iter()
            .position(|o| matches!(o, Opcode::Clear { buf } if *buf == mix_buf))
            .unwrap();
        let mix_positions: Vec<usize> = p
            .opcodes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| match o {
                Opcode::Mix { dst, .. } if *dst == mix_buf => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(mix_positions.len(), 2);
        assert!(mix_positions.iter().all(|&i| i > clear_pos));
    }

    #[test]
    fn unconnected_input_gets_cleared_buffer() {
        let mut g = Graph::new();
        let gain = g.add_node(gain_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(gain, "out", sink, "in:left").unwrap();

        let p = compile(&g, &host(), 1).unwrap();
        let in_buf = p.binding(gain, "in").unwrap();
        assert!(p
            .opcodes
            .iter()
            .any(|o| matches!(o, Opcode::Clear { buf } if *buf == in_buf)));
    }

    #[test]
    fn stream_input_fetches() {
        let mut g = Graph::new();
        let ev = g
            .add_node(Arc::new(NodeDescriptor {
                uri: "builtin://event_source".into(),
                kind: NodeKind::EventSource,
                ports: vec![
                    PortDescriptor::event_input_stream("in", "midi"),
                    PortDescriptor::output("out", PortType::Event),
                ],
                params: vec![],
                latency: 0,
            }))
            .unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        let _ = sink;

        let p = compile(&g, &host(), 1).unwrap();
        let in_buf = p.binding(ev, "in").unwrap();
        assert!(p.opcodes.iter().any(
            |o| matches!(o, Opcode::FetchBuffer { queue, buf } if queue == "midi" && *buf == in_buf)
        ));
    }

    #[test]
    fn muted_output_cleared_after_call() {
        let mut g = Graph::new();
        let src = g.add_node(source_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out:left", sink, "in:left").unwrap();
        g.set_port_property(src, "out:left", Some(true), None).unwrap();

        let p = compile(&g, &host(), 1).unwrap();
        let buf = p.binding(src, "out:left").unwrap();
        let call_pos = p
            .opcodes
            .iter()
            .position(|o| matches!(o, Opcode::CallNode { node, .. } if *node == src))
            .unwrap();
        let clear_pos = p
            .opcodes
            .iter()
            .position(|o| matches!(o, Opcode::Clear { buf: b } if *b == buf))
            .unwrap();
        assert!(clear_pos > call_pos);
    }

    #[test]
    fn compilation_is_deterministic() {
        let mut g = Graph::new();
        let s1 = g.add_node(source_desc()).unwrap();
        let s2 = g.add_node(source_desc()).unwrap();
        let gain = g.add_node(gain_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(s1, "out:left", gain, "in").unwrap();
        g.connect_ports(s2, "out:left", gain, "in").unwrap();
        g.connect_ports(gain, "out", sink, "in:left").unwrap();
        g.connect_ports(s1, "out:right", sink, "in:right").unwrap();

        let a = compile(&g, &host(), 7).unwrap();
        let b = compile(&g, &host(), 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mutation_round_trip_leaves_program_identical() {
        let mut g = Graph::new();
        let src = g.add_node(source_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out:left", sink, "in:left").unwrap();

        let before = compile(&g, &host(), 1).unwrap();
        g.connect_ports(src, "out:right", sink, "in:right").unwrap();
        g.disconnect_ports(src, "out:right", sink, "in:right").unwrap();
        let after = compile(&g, &host(), 2).unwrap();

        assert!(before.same_code(&after));
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let mut g = Graph::new();
        let src = g.add_node(source_desc()).unwrap();
        let gain = g.add_node(gain_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out:left", gain, "in").unwrap();
        g.connect_ports(gain, "out", sink, "in:left").unwrap();

        let p = compile(&g, &host(), 1).unwrap();
        let pos = |node: NodeId| {
            p.opcodes
                .iter()
                .position(|o| matches!(o, Opcode::CallNode { node: n, .. } if *n == node))
        };
        assert!(pos(src).unwrap() < pos(gain).unwrap());
    }

    #[test]
    fn parameters_do_not_affect_code() {
        let mut g = Graph::new();
        let gain = g.add_node(gain_desc()).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(gain, "out", sink, "in:left").unwrap();

        let a = compile(&g, &host(), 1).unwrap();
        g.set_parameter(gain, "gain", ParamValue::Float(0.25)).unwrap();
        let b = compile(&g, &host(), 2).unwrap();
        assert!(a.same_code(&b));
    }
}
