//! Conducto Core - realtime pipeline engine kernel
//!
//! This crate is the heart of the conducto audio workstation: a directed graph
//! of processing nodes is mutated by control threads, compiled into a linear
//! program of opcodes, and executed one block at a time by a realtime audio
//! thread that feeds an output backend.
//!
//! # Architecture
//!
//! The engine uses a **two-object split**:
//!
//! - [`Graph`] — owned by the control side. Holds topology (nodes, connections,
//!   port properties), performs mutations, and is the input to
//!   [`compile()`](compiler::compile). Never touched by the audio thread.
//! - [`Program`] — immutable compiled snapshot: a flat opcode list, a buffer
//!   layout, and a symbol table mapping (node, port) to buffer indices.
//!   Published to the audio thread through an atomic pointer
//!   ([`RtShared`](rt::RtShared)); the audio thread picks it up at the next
//!   block boundary and never sees partial state.
//!
//! The [`Executor`](executor::Executor) owns the runtime node instances
//! (`Box<dyn Processor>`). Processors travel in over an update channel and are
//! shipped back over a reclaim channel when removed, so neither construction
//! nor destruction ever happens on the audio thread.
//!
//! # Realtime discipline
//!
//! One block = one pass through the opcode list against the
//! [`BufferArena`](buffer::BufferArena). Inside a block the audio thread takes
//! no locks, performs no arena allocation, and communicates outward only
//! through bounded channels and atomics. Program swaps, parameter delivery,
//! and node insertion/removal all happen at `BeginFrame`, never mid-block.

pub mod backend;
pub mod buffer;
pub mod compiler;
pub mod context;
pub mod event;
pub mod executor;
pub mod graph;
pub mod node;
pub mod port;
pub mod program;
pub mod rt;

pub use backend::{Backend, BackendError};
pub use buffer::{BufferArena, BufferKind, BufferSpec, PortIo};
pub use compiler::{CompileError, HostParams, compile};
pub use context::{BlockContext, Notification, PerfSnapshot, PerfSpan, PerfTracker};
pub use event::{Event, EventInbox, MAX_EVENTS_PER_BLOCK};
pub use executor::Executor;
pub use graph::{Connection, Graph, GraphError, NodeEntry, PortProps};
pub use node::{
    NodeDescriptor, NodeError, NodeId, NodeKind, ParamKind, ParamSpec, ParamValue, Processor,
};
pub use port::{PortDescriptor, PortDir, PortRef, PortType};
pub use program::{BufferLayout, Opcode, Program};
pub use rt::{ExecutorUpdate, ParamCell, ParamCells, ReclaimedNode, RtShared, StatusRecord};
