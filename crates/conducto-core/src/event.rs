//! Timestamped events and the control-to-backend event inbox.
//!
//! Events carry a sample offset within the current block (0 ≤ offset <
//! block_size). MIDI events are raw 3-byte messages; control events are
//! (name, value, generation) triples where stale generations are discarded
//! on delivery.

use std::sync::Arc;

use parking_lot::Mutex;

/// Upper bound on events held in one buffer slot or queue per block.
///
/// Overflowing events are dropped with a warning; the bound keeps event slots
/// allocation-free on the audio thread.
pub const MAX_EVENTS_PER_BLOCK: usize = 1024;

/// A timestamped event routed through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Raw 3-byte MIDI message at a sample offset within the block.
    Midi {
        /// Status + two data bytes.
        data: [u8; 3],
        /// Sample offset within the current block.
        offset: u32,
    },
    /// Named control change with a generation tag.
    Control {
        /// Control target name.
        name: String,
        /// New value.
        value: f32,
        /// Monotonic generation; deliveries older than the stored generation
        /// are discarded.
        generation: u64,
    },
}

impl Event {
    /// Sample offset within the block (control events sort at offset 0).
    pub fn offset(&self) -> u32 {
        match self {
            Event::Midi { offset, .. } => *offset,
            Event::Control { .. } => 0,
        }
    }
}

/// Shared queue of (queue name, event) pairs travelling from control threads
/// to the audio thread.
///
/// The control surface pushes under a mutex; the backend drains the whole
/// inbox into the block context at `begin_frame`, so events submitted before
/// a block boundary are visible to that block.
#[derive(Clone, Default)]
pub struct EventInbox {
    inner: Arc<Mutex<Vec<(String, Event)>>>,
}

impl EventInbox {
    /// New empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for the next block. Drops (with a warning) beyond the
    /// per-block bound.
    pub fn push(&self, queue: &str, event: Event) {
        let mut pending = self.inner.lock();
        if pending.len() >= MAX_EVENTS_PER_BLOCK {
            tracing::warn!(queue, "event inbox full, dropping event");
            return;
        }
        pending.push((queue.to_owned(), event));
    }

    /// Move all pending events out. Called by backends at `begin_frame`.
    pub fn drain(&self) -> Vec<(String, Event)> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the inbox is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_roundtrip() {
        let inbox = EventInbox::new();
        inbox.push(
            "midi",
            Event::Midi {
                data: [0x90, 60, 100],
                offset: 16,
            },
        );
        assert_eq!(inbox.len(), 1);

        let drained = inbox.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "midi");
        assert!(inbox.is_empty());
    }

    #[test]
    fn inbox_bounded() {
        let inbox = EventInbox::new();
        for i in 0..(MAX_EVENTS_PER_BLOCK + 10) {
            inbox.push(
                "midi",
                Event::Midi {
                    data: [0x90, 60, 100],
                    offset: i as u32,
                },
            );
        }
        assert_eq!(inbox.len(), MAX_EVENTS_PER_BLOCK);
    }

    #[test]
    fn control_events_sort_at_zero() {
        let ev = Event::Control {
            name: "cutoff".into(),
            value: 0.5,
            generation: 3,
        };
        assert_eq!(ev.offset(), 0);
    }
}
