//! The executor — runs one compiled program per audio block.
//!
//! Block state machine: `Idle → BeginFrame → Dispatch* → EndFrame → Idle`.
//!
//! - `BeginFrame`: apply pending structural updates, adopt a newly published
//!   program (rebuilding the arena), and drain dirty parameter cells into
//!   processors.
//! - `Dispatch`: execute opcodes in order. Each `CallNode` is timed as a perf
//!   span; a processor returning an error is quarantined (outputs zeroed,
//!   skipped on later blocks, one `NodeFailed` record) and the block
//!   continues so audio does not drop.
//! - `EndFrame`: flush notifications and perf data to the status channel,
//!   clear scratch event queues, and check the wall-clock budget for xruns.
//!
//! The executor is the only writer to output buffers and perf spans, and the
//! sole reader of the active program pointer during a block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::backend::{Backend, BackendError};
use crate::buffer::{BufferArena, PortIo};
use crate::context::BlockContext;
use crate::node::NodeId;
use crate::program::{Opcode, Program};
use crate::rt::{ExecutorUpdate, ParamCells, ReclaimedNode, RtShared, StatusRecord};

struct RuntimeNode {
    processor: Box<dyn crate::node::Processor>,
    params: Arc<ParamCells>,
    quarantined: bool,
    failure_reported: bool,
}

struct ActiveProgram {
    program: Arc<Program>,
    arena: BufferArena,
}

/// The pipeline VM. Owns the runtime node instances and the buffer arena;
/// driven by a [`Backend`] one block at a time.
pub struct Executor {
    nodes: HashMap<NodeId, RuntimeNode>,
    active: Option<ActiveProgram>,
    shared: Arc<RtShared>,
    updates: Receiver<ExecutorUpdate>,
    reclaim: Sender<ReclaimedNode>,
    status: Sender<StatusRecord>,
}

impl Executor {
    /// New executor wired to the control surface's channels.
    pub fn new(
        shared: Arc<RtShared>,
        updates: Receiver<ExecutorUpdate>,
        reclaim: Sender<ReclaimedNode>,
        status: Sender<StatusRecord>,
    ) -> Self {
        Self {
            nodes: HashMap::new(),
            active: None,
            shared,
            updates,
            reclaim,
            status,
        }
    }

    /// Generation of the active program, 0 if none.
    pub fn active_generation(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.program.generation)
    }

    /// Run blocks until the backend stops, the engine drains, or a backend
    /// swap is requested.
    pub fn run(
        &mut self,
        backend: &mut dyn Backend,
        ctxt: &mut BlockContext,
    ) -> Result<(), BackendError> {
        tracing::info!(backend = backend.name(), "audio loop starting");
        loop {
            if backend.stopped() || self.shared.is_draining() || self.shared.take_stop_request() {
                break;
            }
            if let Err(err) = self.run_block(ctxt, backend) {
                match err {
                    BackendError::Lost(reason) => {
                        let _ = self.status.try_send(StatusRecord::BackendLost {
                            reason: reason.clone(),
                        });
                        tracing::error!(reason, "backend lost, detaching");
                        return Err(BackendError::Lost(reason));
                    }
                    other => return Err(other),
                }
            }
        }
        tracing::info!("audio loop finished");
        Ok(())
    }

    /// Execute exactly one block.
    pub fn run_block(
        &mut self,
        ctxt: &mut BlockContext,
        backend: &mut dyn Backend,
    ) -> Result<(), BackendError> {
        backend.begin_frame(ctxt)?;
        if backend.stopped() {
            return Ok(());
        }

        let started = Instant::now();
        ctxt.perf.begin_block();
        let frame_span = ctxt.perf.start("block", None);

        self.begin_frame(ctxt);
        self.dispatch(ctxt, backend)?;

        ctxt.perf.end(frame_span);
        self.end_frame(ctxt);
        backend.end_frame(ctxt)?;

        // Overrunning the block budget is informational, never fatal.
        if started.elapsed() > ctxt.block_duration() {
            let count = self.shared.record_xrun();
            let _ = self.status.try_send(StatusRecord::XRun { count });
            tracing::warn!(count, sample_pos = ctxt.sample_pos, "block overran its budget");
        }

        ctxt.sample_pos += ctxt.block_size as u64;
        Ok(())
    }

    fn begin_frame(&mut self, ctxt: &mut BlockContext) {
        // Structural updates always land before the program referencing them.
        while let Ok(update) = self.updates.try_recv() {
            match update {
                ExecutorUpdate::AddNode {
                    id,
                    processor,
                    params,
                } => {
                    self.nodes.insert(
                        id,
                        RuntimeNode {
                            processor,
                            params,
                            quarantined: false,
                            failure_reported: false,
                        },
                    );
                }
                ExecutorUpdate::RemoveNode { id } => {
                    if let Some(rn) = self.nodes.remove(&id) {
                        // Cleanup happens on the control side.
                        let _ = self.reclaim.try_send(ReclaimedNode {
                            id,
                            processor: rn.processor,
                        });
                    }
                }
                ExecutorUpdate::ResetNode { id } => {
                    if let Some(rn) = self.nodes.get_mut(&id) {
                        rn.quarantined = false;
                        rn.failure_reported = false;
                    }
                }
                ExecutorUpdate::SetParamBytes { id, name, data } => {
                    if let Some(rn) = self.nodes.get_mut(&id) {
                        let value = crate::node::ParamValue::Bytes(data);
                        if let Err(err) = rn.processor.set_parameter(&name, &value) {
                            tracing::warn!(node = %id, name, %err, "bytes parameter rejected");
                        }
                    }
                }
            }
        }

        // Adopt a newer program; the arena is rebuilt only here.
        if let Some(program) = self.shared.load_program() {
            let current = self.active.as_ref().map(|a| a.program.generation);
            if current != Some(program.generation) {
                let arena = BufferArena::from_layout(
                    &program.layout.specs,
                    program.block_size,
                    program.generation,
                );
                ctxt.block_size = program.block_size;
                ctxt.sample_rate = program.sample_rate;
                ctxt.generation = program.generation;
                tracing::debug!(
                    generation = program.generation,
                    buffers = arena.slot_count(),
                    opcodes = program.opcodes.len(),
                    "program swapped in"
                );
                self.active = Some(ActiveProgram { program, arena });
            }
        } else {
            self.active = None;
        }

        // Drain coalesced parameter writes into processors.
        for (id, rn) in &mut self.nodes {
            let RuntimeNode {
                processor, params, ..
            } = rn;
            for (name, cell) in params.iter() {
                if let Some(value) = cell.take()
                    && let Err(err) =
                        processor.set_parameter(name, &crate::node::ParamValue::Float(value))
                {
                    tracing::warn!(node = %id, name, %err, "parameter rejected");
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        ctxt: &mut BlockContext,
        backend: &mut dyn Backend,
    ) -> Result<(), BackendError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let ActiveProgram { program, arena } = active;

        for op in &program.opcodes {
            match op {
                Opcode::Clear { buf } => arena.clear(*buf),

                Opcode::Mix { src, dst } => arena.mix(*src, *dst),

                Opcode::MergeEvents { src, dst } => arena.merge_events(*src, *dst),

                Opcode::FetchBuffer { queue, buf } => {
                    let events = ctxt.take_queue(queue);
                    let slot = arena.events_mut(*buf);
                    slot.clear();
                    slot.extend(events);
                    slot.sort_by_key(crate::event::Event::offset);
                }

                Opcode::CallNode {
                    node,
                    inputs,
                    outputs,
                } => {
                    let Some(rn) = self.nodes.get_mut(node) else {
                        for &buf in outputs {
                            arena.clear(buf);
                        }
                        continue;
                    };
                    if rn.quarantined {
                        for &buf in outputs {
                            arena.clear(buf);
                        }
                        continue;
                    }

                    let span = ctxt.perf.start("call", Some(*node));
                    ctxt.set_current_node(Some(*node));
                    let mut io = PortIo::new(arena, inputs, outputs);
                    let result = rn.processor.process_block(ctxt, &mut io);
                    ctxt.set_current_node(None);
                    ctxt.perf.end(span);

                    if let Err(err) = result {
                        rn.quarantined = true;
                        for &buf in outputs {
                            arena.clear(buf);
                        }
                        if !rn.failure_reported {
                            rn.failure_reported = true;
                            let _ = self.status.try_send(StatusRecord::NodeFailed {
                                node: *node,
                                kind: err.to_string(),
                            });
                            tracing::error!(node = %node, %err, "node quarantined");
                        }
                    }
                }

                Opcode::Output { channel, buf } => {
                    backend.output(*channel, arena.samples(*buf))?;
                }
            }
        }
        Ok(())
    }

    fn end_frame(&mut self, ctxt: &mut BlockContext) {
        for n in ctxt.take_notifications() {
            let _ = self.status.try_send(StatusRecord::NodeState {
                node: n.node,
                key: n.key,
                value: n.value,
            });
        }
        if ctxt.perf.enabled() {
            let _ = self
                .status
                .try_send(StatusRecord::Perf(ctxt.perf.snapshot(ctxt.sample_pos)));
        }
        ctxt.clear_events();
    }

    /// Ship every runtime node back for cleanup. Called after the audio loop
    /// has finished, during engine drain.
    pub fn drain_nodes(&mut self) {
        for (id, rn) in self.nodes.drain() {
            let _ = self.reclaim.try_send(ReclaimedNode {
                id,
                processor: rn.processor,
            });
        }
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{HostParams, compile};
    use crate::event::Event;
    use crate::graph::Graph;
    use crate::node::{
        NodeDescriptor, NodeError, NodeKind, ParamSpec, ParamValue, Processor,
    };
    use crate::port::{PortDescriptor, PortType};
    use crossbeam_channel::unbounded;

    /// Backend that never paces and captures every output channel.
    struct CaptureBackend {
        channels: Vec<Vec<f32>>,
        stopped: bool,
    }

    impl CaptureBackend {
        fn new() -> Self {
            Self {
                channels: vec![Vec::new(), Vec::new()],
                stopped: false,
            }
        }
    }

    impl Backend for CaptureBackend {
        fn name(&self) -> &str {
            "capture"
        }
        fn begin_frame(&mut self, _ctxt: &mut BlockContext) -> Result<(), BackendError> {
            Ok(())
        }
        fn output(&mut self, channel: usize, samples: &[f32]) -> Result<(), BackendError> {
            self.channels[channel].extend_from_slice(samples);
            Ok(())
        }
        fn end_frame(&mut self, _ctxt: &mut BlockContext) -> Result<(), BackendError> {
            Ok(())
        }
        fn add_event(&mut self, _queue: &str, _event: Event) -> Result<(), BackendError> {
            Ok(())
        }
        fn stop(&mut self) {
            self.stopped = true;
        }
        fn stopped(&self) -> bool {
            self.stopped
        }
    }

    struct ConstSource {
        value: f32,
    }

    impl Processor for ConstSource {
        fn process_block(
            &mut self,
            _ctxt: &mut BlockContext,
            io: &mut PortIo<'_>,
        ) -> Result<(), NodeError> {
            for port in 0..io.output_count() {
                io.output(port).fill(self.value);
            }
            Ok(())
        }
        fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError> {
            match (name, value) {
                ("value", ParamValue::Float(v)) => {
                    self.value = *v;
                    Ok(())
                }
                _ => Err(NodeError::UnknownParameter(name.to_owned())),
            }
        }
    }

    struct FailAfter {
        blocks_left: u32,
    }

    impl Processor for FailAfter {
        fn process_block(
            &mut self,
            _ctxt: &mut BlockContext,
            io: &mut PortIo<'_>,
        ) -> Result<(), NodeError> {
            if self.blocks_left == 0 {
                return Err(NodeError::Process("deliberate failure".into()));
            }
            self.blocks_left -= 1;
            for port in 0..io.output_count() {
                io.output(port).fill(1.0);
            }
            Ok(())
        }
        fn set_parameter(&mut self, name: &str, _value: &ParamValue) -> Result<(), NodeError> {
            Err(NodeError::UnknownParameter(name.to_owned()))
        }
    }

    fn mono_source_desc(uri: &str) -> std::sync::Arc<NodeDescriptor> {
        std::sync::Arc::new(NodeDescriptor {
            uri: uri.into(),
            kind: NodeKind::Source,
            ports: vec![PortDescriptor::output("out", PortType::AudioMono)],
            params: vec![ParamSpec::float("value", -1.0, 1.0, 0.0)],
            latency: 0,
        })
    }

    fn sink_desc() -> std::sync::Arc<NodeDescriptor> {
        std::sync::Arc::new(NodeDescriptor {
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

    struct Rig {
        executor: Executor,
        update_tx: Sender<ExecutorUpdate>,
        status_rx: Receiver<StatusRecord>,
        shared: Arc<RtShared>,
        ctxt: BlockContext,
    }

    fn rig(block_size: usize) -> Rig {
        let shared = Arc::new(RtShared::new());
        let (update_tx, update_rx) = unbounded();
        let (reclaim_tx, _reclaim_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();
        let executor = Executor::new(shared.clone(), update_rx, reclaim_tx, status_tx);
        Rig {
            executor,
            update_tx,
            status_rx,
            shared,
            ctxt: BlockContext::new(block_size, 44100, false),
        }
    }

    fn add_node(rig: &Rig, id: NodeId, processor: Box<dyn Processor>, specs: &[ParamSpec]) {
        rig.update_tx
            .send(ExecutorUpdate::AddNode {
                id,
                processor,
                params: Arc::new(ParamCells::from_specs(specs)),
            })
            .unwrap();
    }

    #[test]
    fn passthrough_source_to_sink() {
        let mut g = Graph::new();
        let src = g.add_node(mono_source_desc("test://const")).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out", sink, "in:left").unwrap();
        g.connect_ports(src, "out", sink, "in:right").unwrap();

        let host = HostParams {
            block_size: 16,
            sample_rate: 44100,
        };
        let program = compile(&g, &host, 1).unwrap();

        let mut r = rig(16);
        add_node(
            &r,
            src,
            Box::new(ConstSource { value: 0.5 }),
            &[ParamSpec::float("value", -1.0, 1.0, 0.0)],
        );
        r.shared.publish(Arc::new(program));

        let mut backend = CaptureBackend::new();
        for _ in 0..4 {
            r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        }

        assert_eq!(backend.channels[0].len(), 64);
        assert!(backend.channels[0].iter().all(|&s| s == 0.5));
        assert!(backend.channels[1].iter().all(|&s| s == 0.5));
        assert_eq!(r.ctxt.sample_pos, 64);
    }

    #[test]
    fn fan_in_mix_sums_to_zero() {
        let mut g = Graph::new();
        let a = g.add_node(mono_source_desc("test://const")).unwrap();
        let b = g.add_node(mono_source_desc("test://const")).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(a, "out", sink, "in:left").unwrap();
        g.connect_ports(b, "out", sink, "in:left").unwrap();

        let host = HostParams {
            block_size: 8,
            sample_rate: 44100,
        };
        let program = compile(&g, &host, 1).unwrap();

        let mut r = rig(8);
        add_node(&r, a, Box::new(ConstSource { value: 0.25 }), &[]);
        add_node(&r, b, Box::new(ConstSource { value: -0.25 }), &[]);
        r.shared.publish(Arc::new(program));

        let mut backend = CaptureBackend::new();
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        assert!(backend.channels[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn failing_node_is_quarantined_once() {
        let mut g = Graph::new();
        let src = g.add_node(mono_source_desc("test://crash")).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out", sink, "in:left").unwrap();

        let host = HostParams {
            block_size: 4,
            sample_rate: 44100,
        };
        let program = compile(&g, &host, 1).unwrap();

        let mut r = rig(4);
        add_node(&r, src, Box::new(FailAfter { blocks_left: 1 }), &[]);
        r.shared.publish(Arc::new(program));

        let mut backend = CaptureBackend::new();
        for _ in 0..10 {
            r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        }

        // Block 0 ran, blocks 1..10 are silence.
        assert!(backend.channels[0][..4].iter().all(|&s| s == 1.0));
        assert!(backend.channels[0][4..].iter().all(|&s| s == 0.0));

        let failures: Vec<_> = r
            .status_rx
            .try_iter()
            .filter(|s| matches!(s, StatusRecord::NodeFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn quarantine_can_be_reset() {
        let mut g = Graph::new();
        let src = g.add_node(mono_source_desc("test://crash")).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out", sink, "in:left").unwrap();
        let program = compile(
            &g,
            &HostParams {
                block_size: 4,
                sample_rate: 44100,
            },
            1,
        )
        .unwrap();

        let mut r = rig(4);
        add_node(&r, src, Box::new(FailAfter { blocks_left: 0 }), &[]);
        r.shared.publish(Arc::new(program));

        let mut backend = CaptureBackend::new();
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        r.update_tx.send(ExecutorUpdate::ResetNode { id: src }).unwrap();
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();

        // Two failures reported: quarantine was lifted and the node failed again.
        let failures = r
            .status_rx
            .try_iter()
            .filter(|s| matches!(s, StatusRecord::NodeFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn parameter_applies_at_next_begin_frame() {
        let mut g = Graph::new();
        let src = g.add_node(mono_source_desc("test://const")).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out", sink, "in:left").unwrap();
        let program = compile(
            &g,
            &HostParams {
                block_size: 4,
                sample_rate: 44100,
            },
            1,
        )
        .unwrap();

        let mut r = rig(4);
        let cells = Arc::new(ParamCells::from_specs(&[ParamSpec::float(
            "value", -1.0, 1.0, 0.0,
        )]));
        r.update_tx
            .send(ExecutorUpdate::AddNode {
                id: src,
                processor: Box::new(ConstSource { value: 1.0 }),
                params: cells.clone(),
            })
            .unwrap();
        r.shared.publish(Arc::new(program));

        let mut backend = CaptureBackend::new();
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        assert!(backend.channels[0][..4].iter().all(|&s| s == 1.0));

        // Write lands between blocks; the immediately following block sees it.
        cells.cell("value").unwrap().set(0.0);
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        assert!(backend.channels[0][4..8].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn program_swap_at_block_boundary() {
        let mut g = Graph::new();
        let src = g.add_node(mono_source_desc("test://const")).unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        g.connect_ports(src, "out", sink, "in:left").unwrap();
        let host = HostParams {
            block_size: 4,
            sample_rate: 44100,
        };

        let mut r = rig(4);
        add_node(&r, src, Box::new(ConstSource { value: 0.5 }), &[]);
        r.shared.publish(Arc::new(compile(&g, &host, 1).unwrap()));

        let mut backend = CaptureBackend::new();
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        assert_eq!(r.executor.active_generation(), 1);

        // Route to the right channel instead; generation 2.
        g.disconnect_ports(src, "out", sink, "in:left").unwrap();
        g.connect_ports(src, "out", sink, "in:right").unwrap();
        r.shared.publish(Arc::new(compile(&g, &host, 2).unwrap()));

        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        assert_eq!(r.executor.active_generation(), 2);
        assert!(backend.channels[1][4..8].iter().all(|&s| s == 0.5));
        // Left channel got the cleared unconnected-input buffer.
        assert!(backend.channels[0][4..8].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn fetch_buffer_delivers_events() {
        use crate::port::PortDir;

        let mut g = Graph::new();
        let ev = g
            .add_node(std::sync::Arc::new(NodeDescriptor {
                uri: "test://events".into(),
                kind: NodeKind::EventSource,
                ports: vec![
                    PortDescriptor::event_input_stream("in", "midi"),
                    PortDescriptor {
                        name: "out".into(),
                        dir: PortDir::Output,
                        types: vec![PortType::Event],
                        stream: None,
                    },
                ],
                params: vec![],
                latency: 0,
            }))
            .unwrap();
        let sink = g.add_node(sink_desc()).unwrap();
        let _ = sink;

        struct EventEcho {
            seen: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        }
        impl Processor for EventEcho {
            fn process_block(
                &mut self,
                _ctxt: &mut BlockContext,
                io: &mut PortIo<'_>,
            ) -> Result<(), NodeError> {
                self.seen.fetch_add(
                    io.input_events(0).len(),
                    std::sync::atomic::Ordering::Relaxed,
                );
                Ok(())
            }
            fn set_parameter(&mut self, name: &str, _: &ParamValue) -> Result<(), NodeError> {
                Err(NodeError::UnknownParameter(name.to_owned()))
            }
        }

        let program = compile(
            &g,
            &HostParams {
                block_size: 4,
                sample_rate: 44100,
            },
            1,
        )
        .unwrap();

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut r = rig(4);
        add_node(&r, ev, Box::new(EventEcho { seen: seen.clone() }), &[]);
        r.shared.publish(Arc::new(program));

        r.ctxt.add_event(
            "midi",
            Event::Midi {
                data: [0x90, 60, 100],
                offset: 2,
            },
        );
        let mut backend = CaptureBackend::new();
        r.executor.run_block(&mut r.ctxt, &mut backend).unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
