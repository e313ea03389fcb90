//! Per-block execution context and performance spans.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::event::{Event, MAX_EVENTS_PER_BLOCK};
use crate::node::NodeId;

/// A single timed span inside one block.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfSpan {
    /// Span label (`"block"` for the frame span, node label otherwise).
    pub label: String,
    /// Node the span was recorded for, if any.
    pub node: Option<NodeId>,
    /// Start offset from engine start, nanoseconds.
    pub start_ns: u64,
    /// End offset from engine start, nanoseconds.
    pub end_ns: u64,
}

impl PerfSpan {
    /// Span duration in nanoseconds.
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// A copy of one block's spans, published to observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfSnapshot {
    /// Absolute frame position of the block the spans belong to.
    pub sample_pos: u64,
    /// Spans in recording order.
    pub spans: Vec<PerfSpan>,
}

/// Records per-node timing spans within a block.
///
/// Disabled trackers are no-ops so the dispatch loop pays nothing when perf
/// tracing is off. Span storage is reused across blocks.
#[derive(Debug)]
pub struct PerfTracker {
    enabled: bool,
    origin: Instant,
    spans: Vec<PerfSpan>,
}

impl PerfTracker {
    /// New tracker; `enabled` gates all recording.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            origin: Instant::now(),
            spans: Vec::with_capacity(64),
        }
    }

    /// Whether recording is active.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Clears spans at block start.
    pub fn begin_block(&mut self) {
        self.spans.clear();
    }

    /// Opens a span; returns a token for [`end`](Self::end).
    pub fn start(&mut self, label: &str, node: Option<NodeId>) -> usize {
        if !self.enabled {
            return usize::MAX;
        }
        let now = self.origin.elapsed().as_nanos() as u64;
        self.spans.push(PerfSpan {
            label: label.to_owned(),
            node,
            start_ns: now,
            end_ns: now,
        });
        self.spans.len() - 1
    }

    /// Closes a span opened by [`start`](Self::start).
    pub fn end(&mut self, token: usize) {
        if token == usize::MAX {
            return;
        }
        let now = self.origin.elapsed().as_nanos() as u64;
        if let Some(span) = self.spans.get_mut(token) {
            span.end_ns = now;
        }
    }

    /// Copies the current spans out.
    pub fn snapshot(&self, sample_pos: u64) -> PerfSnapshot {
        PerfSnapshot {
            sample_pos,
            spans: self.spans.clone(),
        }
    }
}

/// A node-state notification raised during a block (e.g. end-of-stream),
/// drained into the observer queue between blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Node the notification belongs to.
    pub node: NodeId,
    /// State key (e.g. `"end_of_stream"`).
    pub key: String,
    /// State value.
    pub value: String,
}

/// Per-invocation state passed to every opcode.
#[derive(Debug)]
pub struct BlockContext {
    /// Absolute frame counter since engine start.
    pub sample_pos: u64,
    /// Frames in the current block.
    pub block_size: usize,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Generation of the program being executed (0 before the first swap).
    pub generation: u64,
    /// Performance timer for this block.
    pub perf: PerfTracker,
    /// Scratch event queues keyed by logical name, refilled each block.
    events: BTreeMap<String, Vec<Event>>,
    /// Node-state notifications raised during this block.
    notifications: Vec<Notification>,
    /// Node currently inside `process_block`, for notification attribution.
    current_node: Option<NodeId>,
}

impl BlockContext {
    /// New context for a fresh engine run.
    pub fn new(block_size: usize, sample_rate: u32, perf_trace: bool) -> Self {
        Self {
            sample_pos: 0,
            block_size,
            sample_rate,
            generation: 0,
            perf: PerfTracker::new(perf_trace),
            events: BTreeMap::new(),
            notifications: Vec::new(),
            current_node: None,
        }
    }

    /// Wall-clock duration of one block at the current rate.
    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    /// Queue an event for this block. Called by backends during `begin_frame`.
    pub fn add_event(&mut self, queue: &str, event: Event) {
        let q = self.events.entry(queue.to_owned()).or_default();
        if q.len() >= MAX_EVENTS_PER_BLOCK {
            tracing::warn!(queue, "block event queue full, dropping event");
            return;
        }
        q.push(event);
    }

    /// Move a queue's events out (for `FetchBuffer`). Leaves the queue empty.
    pub fn take_queue(&mut self, queue: &str) -> Vec<Event> {
        self.events
            .get_mut(queue)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Drop leftover events at block end; queues are per-block scratch.
    pub fn clear_events(&mut self) {
        for q in self.events.values_mut() {
            q.clear();
        }
    }

    /// Raise a node-state notification, attributed to the node currently
    /// being dispatched.
    pub fn notify(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(node) = self.current_node {
            self.notifications.push(Notification {
                node,
                key: key.into(),
                value: value.into(),
            });
        }
    }

    /// Set or clear the node being dispatched.
    pub(crate) fn set_current_node(&mut self, node: Option<NodeId>) {
        self.current_node = node;
    }

    /// Drain notifications raised this block.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}
