//! Backend drivers for the conducto pipeline engine.
//!
//! Three implementations of [`conducto_core::Backend`]:
//!
//! - [`NullBackend`] — simulated clock for headless runs, tests, and offline
//!   perf measurement.
//! - [`SystemBackend`] — cpal output stream; the device callback drains a
//!   bounded sample FIFO, so the hardware owns the block cadence.
//! - [`IpcBackend`] — publishes blocks into a named shared-memory region for
//!   a cooperating consumer process, with an epoch header so stale consumers
//!   can detect program swaps.

pub mod devices;
pub mod ipc;
pub mod null;
pub mod shm;
pub mod system;

pub use devices::list_output_devices;
pub use ipc::IpcBackend;
pub use null::{CaptureHandle, NullBackend};
pub use shm::{REGION_MAGIC, REGION_VERSION, ShmRegion};
pub use system::{SystemBackend, SystemConfig};
