//! Control surface for the conducto pipeline engine.
//!
//! This crate owns everything the realtime core must not: the writer lock and
//! mutation API, the node registry, session and observer management, engine
//! configuration, and process lifecycle (backend selection, shutdown, exit
//! codes). Mutations flow in through [`Engine`], are validated against the
//! graph model, compiled into a fresh program, and published to the audio
//! thread; change and status records flow out to observers.

pub mod config;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod observer;
pub mod registry;

pub use config::{BackendKind, ConfigError, EngineConfig};
pub use engine::{Engine, ShutdownReason};
pub use error::EngineError;
pub use mutation::{ObserverRecord, PerfSpanRecord};
pub use observer::{SESSION_BUFFER_CAP, SessionFlags, SessionId};
pub use registry::{NodeArtifacts, NodeParams, NodeRegistry};
