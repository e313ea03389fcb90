//! The control ↔ audio thread bridge.
//!
//! Three mechanisms cross the boundary, none of which blocks the audio thread:
//!
//! - [`RtShared`] — the atomic program pointer (`ArcSwap`) plus drain/stop
//!   flags and the xrun counter. The audio thread reads the pointer at
//!   `BeginFrame` only.
//! - [`ExecutorUpdate`] / [`ReclaimedNode`] — bounded channels carrying
//!   processor boxes into the executor and corpses back out, so allocation
//!   and cleanup stay on control threads.
//! - [`ParamCells`] — per-(node, parameter) latest-wins cells: an `AtomicU32`
//!   bit-cast float with a dirty flag and a generation tag. Writers coalesce;
//!   the executor drains dirty cells at `BeginFrame`, bounding parameter
//!   latency to one block without any lock in `Dispatch`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;

use crate::context::PerfSnapshot;
use crate::node::{NodeId, ParamSpec, Processor};
use crate::program::Program;

/// State shared between the control surface and the executor.
#[derive(Default)]
pub struct RtShared {
    program: ArcSwapOption<Program>,
    draining: AtomicBool,
    stop_requested: AtomicBool,
    xruns: AtomicU64,
}

impl RtShared {
    /// New shared state with no program published.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new program. The audio thread adopts it at its next
    /// `BeginFrame`.
    pub fn publish(&self, program: Arc<Program>) {
        self.program.store(Some(program));
    }

    /// Load the latest published program.
    pub fn load_program(&self) -> Option<Arc<Program>> {
        self.program.load_full()
    }

    /// Drop the published program (shutdown).
    pub fn release_program(&self) {
        self.program.store(None);
    }

    /// Generation of the latest published program, 0 if none.
    pub fn published_generation(&self) -> u64 {
        self.program.load().as_ref().map_or(0, |p| p.generation)
    }

    /// Mark the engine draining; the audio thread exits after its current
    /// block.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Whether the engine is draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Ask the audio loop to stop without draining (backend swap).
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Consume a pending stop request.
    pub fn take_stop_request(&self) -> bool {
        self.stop_requested.swap(false, Ordering::AcqRel)
    }

    /// Record one xrun; returns the new total.
    pub fn record_xrun(&self) -> u64 {
        self.xruns.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Total xruns since engine start.
    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Acquire)
    }
}

/// One latest-wins parameter cell: f32 bit-cast into an `AtomicU32`, with a
/// dirty flag and a monotonic generation used to discard stale control-event
/// deliveries.
#[derive(Debug)]
pub struct ParamCell {
    bits: AtomicU32,
    generation: AtomicU64,
    dirty: AtomicBool,
}

impl ParamCell {
    /// New cell holding a default value, not dirty.
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
            generation: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Current value.
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Store a new value and mark dirty. Returns the generation assigned.
    pub fn set(&self, value: f32) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.bits.store(value.to_bits(), Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        generation
    }

    /// Store a value carrying an explicit generation; deliveries older than
    /// the stored generation are discarded. Returns whether the value landed.
    pub fn set_if_newer(&self, value: f32, generation: u64) -> bool {
        let current = self.generation.load(Ordering::Acquire);
        if generation < current {
            return false;
        }
        self.generation.store(generation, Ordering::Release);
        self.bits.store(value.to_bits(), Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Consume the dirty flag; `Some(value)` when a write is pending.
    pub fn take(&self) -> Option<f32> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.get())
        } else {
            None
        }
    }
}

/// All float-parameter cells of one node, keyed by parameter name.
///
/// Built by the control surface at node creation and shared with the
/// executor; both sides hold the same `Arc`.
#[derive(Debug, Default)]
pub struct ParamCells {
    cells: BTreeMap<String, ParamCell>,
}

impl ParamCells {
    /// Build cells from a descriptor's float parameter specs.
    pub fn from_specs(specs: &[ParamSpec]) -> Self {
        let cells = specs
            .iter()
            .filter(|s| s.kind == crate::node::ParamKind::Float)
            .map(|s| (s.name.clone(), ParamCell::new(s.default)))
            .collect();
        Self { cells }
    }

    /// Cell for a parameter name.
    pub fn cell(&self, name: &str) -> Option<&ParamCell> {
        self.cells.get(name)
    }

    /// Iterate cells in name order (deterministic drain order).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamCell)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether there are no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Control → executor structural updates, drained at `BeginFrame`.
pub enum ExecutorUpdate {
    /// Insert a runtime node. Sent before the program referencing it is
    /// published.
    AddNode {
        /// Graph id of the node.
        id: NodeId,
        /// The processor, already `setup()` on a control thread.
        processor: Box<dyn Processor>,
        /// Shared parameter cells for this node.
        params: Arc<ParamCells>,
    },
    /// Remove a runtime node; its processor is shipped back for cleanup.
    RemoveNode {
        /// Graph id of the node.
        id: NodeId,
    },
    /// Lift a node's quarantine.
    ResetNode {
        /// Graph id of the node.
        id: NodeId,
    },
    /// Deliver a byte-valued parameter (paths, blobs).
    SetParamBytes {
        /// Target node.
        id: NodeId,
        /// Parameter name.
        name: String,
        /// Value.
        data: Vec<u8>,
    },
}

/// A removed processor travelling back to the control side for `cleanup()`
/// and deallocation.
pub struct ReclaimedNode {
    /// Graph id the processor belonged to.
    pub id: NodeId,
    /// The processor box.
    pub processor: Box<dyn Processor>,
}

/// Executor → control status stream, forwarded to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusRecord {
    /// Per-node timing for one block (only when perf tracing is on).
    Perf(PerfSnapshot),
    /// A node-state notification (e.g. end-of-stream).
    NodeState {
        /// Node the state belongs to.
        node: NodeId,
        /// State key.
        key: String,
        /// State value.
        value: String,
    },
    /// A node failed and was quarantined. Sent exactly once per failure.
    NodeFailed {
        /// Failing node.
        node: NodeId,
        /// Failure description.
        kind: String,
    },
    /// A block overran its wall-clock budget.
    XRun {
        /// Total xruns since engine start.
        count: u64,
    },
    /// The backend was lost mid-run; the sink carries the detail.
    BackendLost {
        /// Failure description.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_cell_latest_wins() {
        let cell = ParamCell::new(1.0);
        assert_eq!(cell.take(), None);

        cell.set(2.0);
        cell.set(0.5);
        assert_eq!(cell.take(), Some(0.5));
        assert_eq!(cell.take(), None);
    }

    #[test]
    fn param_cell_discards_stale_generations() {
        let cell = ParamCell::new(0.0);
        let g = cell.set(1.0);
        assert!(!cell.set_if_newer(9.0, g - 1));
        assert_eq!(cell.get(), 1.0);
        assert!(cell.set_if_newer(2.0, g + 1));
        assert_eq!(cell.get(), 2.0);
    }

    #[test]
    fn cells_only_cover_float_params() {
        let specs = vec![
            ParamSpec::float("gain", 0.0, 1.0, 0.5),
            ParamSpec::bytes("path"),
        ];
        let cells = ParamCells::from_specs(&specs);
        assert_eq!(cells.len(), 1);
        assert!(cells.cell("gain").is_some());
        assert!(cells.cell("path").is_none());
        assert_eq!(cells.cell("gain").unwrap().get(), 0.5);
    }

    #[test]
    fn shared_program_pointer() {
        let shared = RtShared::new();
        assert!(shared.load_program().is_none());
        assert_eq!(shared.published_generation(), 0);
    }

    #[test]
    fn xrun_counter() {
        let shared = RtShared::new();
        assert_eq!(shared.record_xrun(), 1);
        assert_eq!(shared.record_xrun(), 2);
        assert_eq!(shared.xrun_count(), 2);
    }

    #[test]
    fn stop_request_is_consumed() {
        let shared = RtShared::new();
        assert!(!shared.take_stop_request());
        shared.request_stop();
        assert!(shared.take_stop_request());
        assert!(!shared.take_stop_request());
    }
}
