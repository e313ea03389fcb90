//! The engine: graph mutations, program publication, and process lifecycle.
//!
//! One `Engine` owns the whole pipeline: the graph model behind a
//! reader/writer lock, the node registry, the executor and its channels, the
//! backend slot, and the observer hub. Control threads mutate through the
//! methods here; each mutation recompiles the graph and publishes the new
//! program through the atomic pointer the audio thread checks at block
//! boundaries.
//!
//! Two auxiliary threads exist: the audio thread (spawned by [`start`]) and a
//! dispatcher thread that forwards executor status records to observers,
//! runs `cleanup()` on reclaimed processors, and auto-removes `play_file`
//! nodes when their stream ends.
//!
//! [`start`]: Engine::start

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde_json::json;

use conducto_core::{
    Backend, BlockContext, EventInbox, Executor, ExecutorUpdate, Graph, HostParams, NodeId,
    ParamCells, ParamValue, ReclaimedNode, RtShared, StatusRecord, compile,
};
use conducto_io::{IpcBackend, NullBackend, SystemBackend, SystemConfig};

use crate::config::{BackendKind, EngineConfig};
use crate::error::EngineError;
use crate::mutation::ObserverRecord;
use crate::observer::{Drained, ObserverHub, SessionFlags, SessionId};
use crate::registry::{NodeParams, NodeRegistry};

/// Why the engine stopped; drives the process exit code for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownReason {
    /// Normal shutdown. Exit code 0.
    #[default]
    Clean,
    /// Unhandled engine error. Exit code 1.
    Error,
    /// Supervisor should restart with saved state. Exit code 2.
    RestartClean,
    /// Supervisor should restart discarding state. Exit code 3.
    RestartDirty,
}

impl ShutdownReason {
    /// Process exit code for the external supervisor.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Clean => 0,
            ShutdownReason::Error => 1,
            ShutdownReason::RestartClean => 2,
            ShutdownReason::RestartDirty => 3,
        }
    }
}

struct ModelState {
    graph: Graph,
    generation: u64,
    cells: BTreeMap<NodeId, Arc<ParamCells>>,
    host: HostParams,
}

struct EngineInner {
    config: EngineConfig,
    registry: NodeRegistry,
    state: RwLock<ModelState>,
    shared: Arc<RtShared>,
    inbox: EventInbox,
    observers: ObserverHub,

    update_tx: Sender<ExecutorUpdate>,
    status_rx: Receiver<StatusRecord>,
    reclaim_rx: Receiver<ReclaimedNode>,

    executor: Mutex<Option<Executor>>,
    block_ctxt: Mutex<Option<BlockContext>>,
    pending_backend: Mutex<Option<Box<dyn Backend>>>,
    backend_kind: Mutex<Option<BackendKind>>,
    audio_thread: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,

    draining: AtomicBool,
    torn_down: AtomicBool,
    exit: Mutex<ShutdownReason>,

    /// Nodes auto-removed on their end-of-stream notification (play_file).
    auto_remove: Mutex<BTreeSet<NodeId>>,
    last_perf: Mutex<Option<ObserverRecord>>,

    sink: NodeId,
    writer_timeout: Duration,
}

/// The engine handle. Methods are safe to call from any control thread;
/// dropping the handle shuts the engine down cleanly.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine: create the sink, compile the empty program, and start
    /// the dispatcher thread. No backend is attached yet.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let registry = NodeRegistry::with_builtins();
        let shared = Arc::new(RtShared::new());
        let (update_tx, update_rx) = unbounded();
        let (reclaim_tx, reclaim_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();

        let executor = Executor::new(shared.clone(), update_rx, reclaim_tx, status_tx);

        let mut graph = Graph::new();
        let sink_artifacts = registry.create("builtin://sink", &NodeParams::new())?;
        let sink = graph.add_node(sink_artifacts.descriptor)?;

        let host = HostParams {
            block_size: config.block_size,
            sample_rate: config.sample_rate,
        };
        let program = compile(&graph, &host, 1)?;
        shared.publish(Arc::new(program));

        let writer_timeout = Duration::from_millis(config.writer_timeout_ms);
        let inner = Arc::new(EngineInner {
            config,
            registry,
            state: RwLock::new(ModelState {
                graph,
                generation: 1,
                cells: BTreeMap::new(),
                host,
            }),
            shared,
            inbox: EventInbox::new(),
            observers: ObserverHub::new(),
            update_tx,
            status_rx,
            reclaim_rx,
            executor: Mutex::new(Some(executor)),
            block_ctxt: Mutex::new(None),
            pending_backend: Mutex::new(None),
            backend_kind: Mutex::new(None),
            audio_thread: Mutex::new(None),
            dispatcher: Mutex::new(None),
            draining: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            exit: Mutex::new(ShutdownReason::Clean),
            auto_remove: Mutex::new(BTreeSet::new()),
            last_perf: Mutex::new(None),
            sink,
            writer_timeout,
        });

        let dispatcher_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("conducto-dispatch".into())
            .spawn(move || dispatcher_loop(&dispatcher_inner))?;
        *inner.dispatcher.lock() = Some(handle);

        tracing::info!(
            block_size = inner.config.block_size,
            sample_rate = inner.config.sample_rate,
            sink = %sink,
            "engine created"
        );
        Ok(Self { inner })
    }

    /// The sink node's id.
    pub fn sink(&self) -> NodeId {
        self.inner.sink
    }

    /// The event inbox shared with backends (mainly for tests).
    pub fn inbox(&self) -> EventInbox {
        self.inner.inbox.clone()
    }

    // --- Graph mutations ---

    /// Create a node from a registered descriptor URI.
    ///
    /// `setup` runs on the calling thread before the writer lock is taken;
    /// a setup failure leaves the engine untouched.
    pub fn add_node(&self, uri: &str, params: NodeParams) -> Result<NodeId, EngineError> {
        self.inner.add_node(uri, params)
    }

    /// Remove a node and all connections touching it.
    pub fn remove_node(&self, id: NodeId) -> Result<(), EngineError> {
        self.inner.remove_node(id)
    }

    /// Connect an output port to an input port.
    pub fn connect_ports(
        &self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<(), EngineError> {
        self.inner.connect_ports(src_node, src_port, dst_node, dst_port)
    }

    /// Remove a connection.
    pub fn disconnect_ports(
        &self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<(), EngineError> {
        self.inner
            .disconnect_ports(src_node, src_port, dst_node, dst_port)
    }

    /// Set a node parameter; takes effect no later than the next block.
    pub fn set_parameter(
        &self,
        id: NodeId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), EngineError> {
        self.inner.set_parameter(id, name, value)
    }

    /// Update a port property (`muted` on outputs, `stream` on event inputs).
    pub fn set_port_property(
        &self,
        id: NodeId,
        port: &str,
        muted: Option<bool>,
        stream: Option<Option<String>>,
    ) -> Result<(), EngineError> {
        self.inner.set_port_property(id, port, muted, stream)
    }

    /// Change the block size; recompiles and reallocates at the next block
    /// boundary.
    pub fn set_block_size(&self, block_size: usize) -> Result<(), EngineError> {
        self.inner.set_block_size(block_size)
    }

    /// Queue an event for the next block.
    pub fn add_event(&self, queue: &str, event: conducto_core::Event) -> Result<(), EngineError> {
        if self.inner.backend_kind.lock().is_none()
            && self.inner.pending_backend.lock().is_none()
        {
            return Err(EngineError::NoBackend);
        }
        self.inner.inbox.push(queue, event);
        Ok(())
    }

    /// Play a WAV file: creates a file source wired to the sink, auto-removed
    /// when the stream ends. Returns the source node id.
    pub fn play_file(&self, path: &str) -> Result<NodeId, EngineError> {
        self.inner.play_file(path)
    }

    /// Serialise the graph, program, and live perf state for diagnostics.
    pub fn dump(&self) -> serde_json::Value {
        self.inner.dump()
    }

    // --- Sessions ---

    /// Open an observer session. The session starts in `Connecting` with a
    /// replay of the current graph buffered.
    pub fn start_session(&self, flags: SessionFlags) -> SessionId {
        self.inner.start_session(flags)
    }

    /// Transition a session to `Live`, returning everything buffered
    /// (beginning with the replay).
    pub fn attach_session(&self, id: SessionId) -> Result<Vec<ObserverRecord>, EngineError> {
        self.inner.drain_session(id, true)
    }

    /// Drain a live session's pending records.
    pub fn poll_session(&self, id: SessionId) -> Result<Vec<ObserverRecord>, EngineError> {
        self.inner.drain_session(id, false)
    }

    /// Drop a session back to `Connecting` (records keep buffering).
    pub fn detach_session(&self, id: SessionId) -> Result<(), EngineError> {
        self.inner.observers.detach(id)
    }

    /// Close a session.
    pub fn end_session(&self, id: SessionId) -> Result<(), EngineError> {
        self.inner.observers.end_session(id)
    }

    // --- Backend and lifecycle ---

    /// Attach a backend by kind. Returns the shared-memory region name for
    /// the ipc backend. Passing `None` detaches. A running engine swaps at
    /// the next block boundary.
    pub fn set_backend(&self, kind: Option<BackendKind>) -> Result<Option<String>, EngineError> {
        EngineInner::set_backend(&self.inner, kind)
    }

    /// Attach a backend by wire name (`"null"`, `"system"`, `"ipc"`).
    pub fn set_backend_named(&self, name: &str) -> Result<Option<String>, EngineError> {
        let kind = BackendKind::parse(name)
            .ok_or_else(|| EngineError::UnknownBackend(name.to_owned()))?;
        self.set_backend(Some(kind))
    }

    /// Install a concrete backend instance (tests, custom drivers).
    pub fn install_backend(&self, backend: Box<dyn Backend>) {
        let was_running = self.inner.stop_audio_loop();
        *self.inner.pending_backend.lock() = Some(backend);
        let mut kind = self.inner.backend_kind.lock();
        if kind.is_none() {
            *kind = Some(BackendKind::Null);
        }
        drop(kind);
        if was_running {
            let _ = EngineInner::start_audio_loop(&self.inner);
        }
    }

    /// Spawn the audio thread against the pending backend.
    pub fn start(&self) -> Result<(), EngineError> {
        EngineInner::start_audio_loop(&self.inner)
    }

    /// Run `blocks` blocks synchronously on the calling thread. Only valid
    /// while the audio thread is not running; used by tests and offline runs.
    pub fn drive_blocks(&self, blocks: usize) -> Result<(), EngineError> {
        self.inner.drive_blocks(blocks)
    }

    /// Block until the audio thread exits.
    pub fn join_audio(&self) {
        let handle = self.inner.audio_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Drain and stop: reject further mutations, finish the current block,
    /// detach the backend, release the program, and clean up every node.
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.inner.shutdown(reason);
    }

    /// Exit code for the external supervisor.
    pub fn exit_code(&self) -> i32 {
        self.inner.exit.lock().exit_code()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown(ShutdownReason::Clean);
    }
}

impl EngineInner {
    fn writer(&self) -> Result<RwLockWriteGuard<'_, ModelState>, EngineError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        self.state
            .try_write_for(self.writer_timeout)
            .ok_or(EngineError::LockTimeout)
    }

    /// Recompile under the writer lock and publish the program. A compile
    /// failure here means a committed graph is unrunnable: fatal.
    fn recompile(&self, st: &mut ModelState) -> Result<(), EngineError> {
        st.generation += 1;
        match compile(&st.graph, &st.host, st.generation) {
            Ok(program) => {
                self.shared.publish(Arc::new(program));
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, generation = st.generation, "committed graph failed to compile");
                *self.exit.lock() = ShutdownReason::Error;
                self.draining.store(true, Ordering::Release);
                self.shared.set_draining();
                Err(EngineError::GraphInvalid(err))
            }
        }
    }

    fn add_node(&self, uri: &str, params: NodeParams) -> Result<NodeId, EngineError> {
        let mut artifacts = self.registry.create(uri, &params)?;
        if artifacts.descriptor.kind == conducto_core::NodeKind::Sink {
            // The engine owns the one sink; a second one would be rejected by
            // the graph anyway, fail early with the caller-facing error.
            return Err(EngineError::Graph(conducto_core::GraphError::DuplicateSink));
        }
        if let Some(processor) = artifacts.processor.as_mut() {
            processor
                .setup()
                .map_err(|e| EngineError::SetupFailed(e.to_string()))?;
        }

        let mut st = match self.writer() {
            Ok(st) => st,
            Err(err) => {
                // Setup already ran; unwind its resources before surfacing.
                if let Some(processor) = artifacts.processor.as_mut() {
                    processor.cleanup();
                }
                return Err(err);
            }
        };
        let id = st.graph.add_node(Arc::clone(&artifacts.descriptor))?;

        // Record creation parameters in the model (latest-wins store).
        for (name, value) in &params {
            let _ = st.graph.set_parameter(id, name, value.clone());
        }

        let cells = Arc::new(ParamCells::from_specs(&artifacts.descriptor.params));
        st.cells.insert(id, Arc::clone(&cells));

        if let Some(processor) = artifacts.processor.take() {
            let _ = self.update_tx.send(ExecutorUpdate::AddNode {
                id,
                processor,
                params: cells,
            });
        }

        self.recompile(&mut st)?;
        self.observers.publish(&ObserverRecord::AddNode {
            id: id.raw(),
            uri: uri.to_owned(),
        });
        tracing::info!(node = %id, uri, "node added");
        Ok(id)
    }

    fn remove_node(&self, id: NodeId) -> Result<(), EngineError> {
        let mut st = self.writer()?;
        st.graph.remove_node(id)?;
        st.cells.remove(&id);
        self.recompile(&mut st)?;
        let _ = self.update_tx.send(ExecutorUpdate::RemoveNode { id });
        self.observers
            .publish(&ObserverRecord::RemoveNode { id: id.raw() });
        tracing::info!(node = %id, "node removed");
        Ok(())
    }

    fn connect_ports(
        &self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<(), EngineError> {
        let mut st = self.writer()?;
        let ty = st
            .graph
            .connect_ports(src_node, src_port, dst_node, dst_port)?;
        self.recompile(&mut st)?;
        self.observers.publish(&ObserverRecord::ConnectPorts {
            src_node: src_node.raw(),
            src_port: src_port.to_owned(),
            dst_node: dst_node.raw(),
            dst_port: dst_port.to_owned(),
            ty: ty.name().to_owned(),
        });
        Ok(())
    }

    fn disconnect_ports(
        &self,
        src_node: NodeId,
        src_port: &str,
        dst_node: NodeId,
        dst_port: &str,
    ) -> Result<(), EngineError> {
        let mut st = self.writer()?;
        st.graph
            .disconnect_ports(src_node, src_port, dst_node, dst_port)?;
        self.recompile(&mut st)?;
        self.observers.publish(&ObserverRecord::DisconnectPorts {
            src_node: src_node.raw(),
            src_port: src_port.to_owned(),
            dst_node: dst_node.raw(),
            dst_port: dst_port.to_owned(),
        });
        Ok(())
    }

    fn set_parameter(&self, id: NodeId, name: &str, value: ParamValue) -> Result<(), EngineError> {
        let mut st = self.writer()?;
        let stored = st.graph.set_parameter(id, name, value)?;
        match stored {
            ParamValue::Float(v) => {
                if let Some(cell) = st.cells.get(&id).and_then(|c| c.cell(name)) {
                    cell.set(v);
                }
            }
            ParamValue::Bytes(data) => {
                let _ = self.update_tx.send(ExecutorUpdate::SetParamBytes {
                    id,
                    name: name.to_owned(),
                    data,
                });
            }
        }
        Ok(())
    }

    fn set_port_property(
        &self,
        id: NodeId,
        port: &str,
        muted: Option<bool>,
        stream: Option<Option<String>>,
    ) -> Result<(), EngineError> {
        let mut st = self.writer()?;
        st.graph.set_port_property(id, port, muted, stream)?;
        self.recompile(&mut st)?;
        Ok(())
    }

    fn set_block_size(&self, block_size: usize) -> Result<(), EngineError> {
        if !EngineConfig::block_size_ok(block_size) {
            return Err(EngineError::InvalidBlockSize(block_size));
        }
        let mut st = self.writer()?;
        st.host.block_size = block_size;
        self.recompile(&mut st)?;
        tracing::info!(block_size, "block size changed");
        Ok(())
    }

    fn play_file(&self, path: &str) -> Result<NodeId, EngineError> {
        let mut params = NodeParams::new();
        params.insert("path".into(), ParamValue::Bytes(path.as_bytes().to_vec()));
        let id = self.add_node("builtin://wavfile", params)?;

        let wired = self
            .connect_ports(id, "out:left", self.sink, "in:left")
            .and_then(|()| self.connect_ports(id, "out:right", self.sink, "in:right"));
        if let Err(err) = wired {
            // Unwind the half-built player before surfacing the error.
            let _ = self.remove_node(id);
            return Err(err);
        }

        self.auto_remove.lock().insert(id);
        tracing::info!(node = %id, path, "playing file");
        Ok(id)
    }

    fn dump(&self) -> serde_json::Value {
        let st = self.state.read();
        let program = self.shared.load_program();
        json!({
            "generation": st.generation,
            "block_size": st.host.block_size,
            "sample_rate": st.host.sample_rate,
            "sink": self.sink.raw(),
            "nodes": st.graph.iter_nodes().map(|n| json!({
                "id": n.id.raw(),
                "uri": n.descriptor.uri.clone(),
            })).collect::<Vec<_>>(),
            "connections": st.graph.iter_connections().map(|c| json!({
                "src": format!("{}", c.source),
                "dst": format!("{}", c.dest),
                "type": c.ty.name(),
            })).collect::<Vec<_>>(),
            "program": program.map(|p| json!({
                "generation": p.generation,
                "opcodes": p.opcodes.len(),
                "buffers": p.layout.len(),
            })),
            "xruns": self.shared.xrun_count(),
            "perf": self.last_perf.lock().clone(),
        })
    }

    fn start_session(&self, flags: SessionFlags) -> SessionId {
        // The read lock keeps writers (and their publishes) out while the
        // replay is seeded, so the session sees a consistent prefix.
        let st = self.state.read();
        let id = self.observers.start_session(flags);
        let replay = replay_records(&st.graph);
        let _ = self.observers.seed(id, replay);
        id
    }

    fn drain_session(&self, id: SessionId, attach: bool) -> Result<Vec<ObserverRecord>, EngineError> {
        let drained = if attach {
            self.observers.attach(id)?
        } else {
            self.observers.take(id)?
        };
        match drained {
            Drained::Records(records) => Ok(records),
            Drained::Stale => {
                // Overflow lost history; rebuild from a full replay.
                let st = self.state.read();
                let replay = replay_records(&st.graph);
                drop(st);
                self.observers.seed(id, replay)?;
                match self.observers.take(id)? {
                    Drained::Records(records) => Ok(records),
                    Drained::Stale => Ok(Vec::new()),
                }
            }
        }
    }

    fn set_backend(
        inner: &Arc<Self>,
        kind: Option<BackendKind>,
    ) -> Result<Option<String>, EngineError> {
        let was_running = inner.stop_audio_loop();

        let Some(kind) = kind else {
            *inner.pending_backend.lock() = None;
            *inner.backend_kind.lock() = None;
            tracing::info!("backend detached");
            return Ok(None);
        };

        let host = inner.state.read().host;
        let mut region_name = None;
        let backend: Box<dyn Backend> = match kind {
            BackendKind::Null => Box::new(NullBackend::new(inner.inbox.clone(), true)),
            BackendKind::System => Box::new(SystemBackend::new(
                inner.inbox.clone(),
                SystemConfig {
                    device: None,
                    sample_rate: host.sample_rate,
                    block_size: host.block_size,
                    channels: 2,
                },
            )?),
            BackendKind::Ipc => {
                let name = inner
                    .config
                    .shm_region
                    .clone()
                    .unwrap_or_else(|| "conducto-audio".to_owned());
                let backend = IpcBackend::new(
                    inner.inbox.clone(),
                    &name,
                    host.block_size,
                    2,
                    host.sample_rate,
                )?;
                region_name = Some(name);
                Box::new(backend)
            }
        };

        *inner.pending_backend.lock() = Some(backend);
        *inner.backend_kind.lock() = Some(kind);
        tracing::info!(backend = kind.name(), "backend attached");

        if was_running {
            Self::start_audio_loop(inner)?;
        }
        Ok(region_name)
    }

    fn start_audio_loop(this: &Arc<Self>) -> Result<(), EngineError> {
        let mut thread_slot = this.audio_thread.lock();
        if thread_slot.is_some() {
            return Ok(());
        }

        let mut executor = this
            .executor
            .lock()
            .take()
            .ok_or(EngineError::ShuttingDown)?;
        let Some(mut backend) = this.pending_backend.lock().take() else {
            // Put the executor back before failing.
            *this.executor.lock() = Some(executor);
            return Err(EngineError::NoBackend);
        };

        // Clear a stop request left over from a previous swap.
        let _ = this.shared.take_stop_request();

        let inner = Arc::clone(this);
        let handle = std::thread::Builder::new()
            .name("conducto-audio".into())
            .spawn(move || {
                let mut ctxt = inner.block_ctxt.lock().take().unwrap_or_else(|| {
                    let host = inner.state.read().host;
                    BlockContext::new(host.block_size, host.sample_rate, inner.config.perf_trace)
                });
                if let Err(err) = executor.run(backend.as_mut(), &mut ctxt) {
                    tracing::error!(%err, "audio loop ended with error");
                }
                *inner.block_ctxt.lock() = Some(ctxt);
                *inner.executor.lock() = Some(executor);
                // The backend is dropped here, off the control path.
            })?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the audio loop if it is running; returns whether it was.
    fn stop_audio_loop(&self) -> bool {
        let handle = self.audio_thread.lock().take();
        match handle {
            Some(handle) => {
                self.shared.request_stop();
                let _ = handle.join();
                true
            }
            None => false,
        }
    }

    fn drive_blocks(&self, blocks: usize) -> Result<(), EngineError> {
        let mut executor_slot = self.executor.lock();
        let executor = executor_slot.as_mut().ok_or(EngineError::ShuttingDown)?;
        let mut backend_slot = self.pending_backend.lock();
        let backend = backend_slot.as_mut().ok_or(EngineError::NoBackend)?;
        let mut ctxt_slot = self.block_ctxt.lock();
        let ctxt = ctxt_slot.get_or_insert_with(|| {
            let host = self.state.read().host;
            BlockContext::new(host.block_size, host.sample_rate, self.config.perf_trace)
        });
        for _ in 0..blocks {
            executor.run_block(ctxt, backend.as_mut())?;
        }
        Ok(())
    }

    fn shutdown(&self, reason: ShutdownReason) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.draining.swap(true, Ordering::AcqRel) {
            *self.exit.lock() = reason;
        }
        tracing::info!(?reason, "engine shutting down");
        self.shared.set_draining();

        let handle = self.audio_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if let Some(executor) = self.executor.lock().as_mut() {
            executor.drain_nodes();
        }
        self.shared.release_program();
        *self.pending_backend.lock() = None;
        *self.backend_kind.lock() = None;

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.join();
        }

        // Anything the dispatcher missed still gets its cleanup.
        while let Ok(mut reclaimed) = self.reclaim_rx.try_recv() {
            reclaimed.processor.cleanup();
        }
        tracing::info!("engine stopped");
    }

    fn handle_status(&self, status: StatusRecord) {
        let record = ObserverRecord::from_status(status, self.sink.raw());

        if record.is_perf() {
            *self.last_perf.lock() = Some(record.clone());
        }

        // play_file sources remove themselves when the stream ends.
        if let ObserverRecord::NodeState { id, ref key, .. } = record
            && key == "end_of_stream"
        {
            let node = NodeId::from_raw(id);
            let watched = self.auto_remove.lock().remove(&node);
            if watched {
                tracing::debug!(node = %node, "end of stream, removing player");
                self.observers.publish(&record);
                if let Err(err) = self.remove_node(node) {
                    tracing::warn!(node = %node, %err, "auto-remove failed");
                }
                return;
            }
        }

        self.observers.publish(&record);
    }
}

fn replay_records(graph: &Graph) -> Vec<ObserverRecord> {
    let mut records = Vec::with_capacity(graph.node_count() + graph.connection_count());
    for node in graph.iter_nodes() {
        records.push(ObserverRecord::AddNode {
            id: node.id.raw(),
            uri: node.descriptor.uri.clone(),
        });
    }
    for conn in graph.iter_connections() {
        records.push(ObserverRecord::ConnectPorts {
            src_node: conn.source.node.raw(),
            src_port: conn.source.port.clone(),
            dst_node: conn.dest.node.raw(),
            dst_port: conn.dest.port.clone(),
            ty: conn.ty.name().to_owned(),
        });
    }
    records
}

fn dispatcher_loop(inner: &Arc<EngineInner>) {
    loop {
        crossbeam_channel::select! {
            recv(inner.status_rx) -> msg => match msg {
                Ok(status) => inner.handle_status(status),
                Err(_) => break,
            },
            recv(inner.reclaim_rx) -> msg => match msg {
                Ok(mut reclaimed) => reclaimed.processor.cleanup(),
                Err(_) => break,
            },
            default(Duration::from_millis(20)) => {
                if inner.draining.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }

    // Final sweep after the audio loop has drained.
    while let Ok(status) = inner.status_rx.try_recv() {
        inner.handle_status(status);
    }
    while let Ok(mut reclaimed) = inner.reclaim_rx.try_recv() {
        reclaimed.processor.cleanup();
    }
}
