//! The backend driver contract.
//!
//! A backend owns the block cadence: `begin_frame` returns when the next
//! block should run (paced by a device, a simulated clock, or a shared-memory
//! consumer), and the executor reacts. Implementations live in `conducto-io`.

use thiserror::Error;

use crate::context::BlockContext;
use crate::event::Event;

/// Errors surfaced by backend drivers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The underlying device or region went away; the engine detaches the
    /// backend and keeps running.
    #[error("backend lost: {0}")]
    Lost(String),
    /// I/O failure while moving frames.
    #[error("backend io error")]
    Io(#[from] std::io::Error),
}

/// A pluggable output driver for the executor.
///
/// Per block the executor calls `begin_frame` (cadence + input events),
/// `output` once per sink channel, and `end_frame`. All calls happen on the
/// audio thread; `add_event` may also be called from control threads through
/// the shared event inbox a backend drains in `begin_frame`.
pub trait Backend: Send {
    /// Driver name for diagnostics (`"null"`, `"system"`, `"ipc"`).
    fn name(&self) -> &str;

    /// Block until the next block should run; ingest input events into the
    /// context.
    fn begin_frame(&mut self, ctxt: &mut BlockContext) -> Result<(), BackendError>;

    /// Deliver one finished output channel for the current block.
    fn output(&mut self, channel: usize, samples: &[f32]) -> Result<(), BackendError>;

    /// Finish the current block (flush, pace, publish).
    fn end_frame(&mut self, ctxt: &mut BlockContext) -> Result<(), BackendError>;

    /// Queue an event for the next block's context.
    fn add_event(&mut self, queue: &str, event: Event) -> Result<(), BackendError>;

    /// Request the driver to stop; `begin_frame` must not block afterwards.
    fn stop(&mut self);

    /// Whether the driver has stopped.
    fn stopped(&self) -> bool;
}
