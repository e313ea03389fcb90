//! Error types for control-surface operations.

use thiserror::Error;

use conducto_core::{BackendError, CompileError, GraphError};

use crate::config::ConfigError;

/// Error type for all control-surface operations.
///
/// Caller errors leave the graph unchanged; setup failures are unwound before
/// the writer lock is released; `GraphInvalid` marks the engine fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A graph-model mutation was rejected.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// No session with this id.
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// No node factory registered for this URI.
    #[error("unknown node descriptor {0:?}")]
    UnknownDescriptor(String),

    /// Node `setup` failed; nothing was added to the graph.
    #[error("node setup failed: {0}")]
    SetupFailed(String),

    /// No backend driver with this name.
    #[error("unknown backend {0:?}")]
    UnknownBackend(String),

    /// Rejected block size.
    #[error("invalid block size {0}")]
    InvalidBlockSize(usize),

    /// The engine configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An operation needed a backend but none is attached.
    #[error("no backend active")]
    NoBackend,

    /// The engine is draining; mutations are rejected.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Writer lock acquisition timed out.
    #[error("writer lock timed out")]
    LockTimeout,

    /// A committed graph failed to compile. Fatal: the engine refuses further
    /// mutations and stops cleanly.
    #[error("graph failed to compile: {0}")]
    GraphInvalid(#[from] CompileError),

    /// Backend driver failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Filesystem error (play_file, config).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
