//! Buffer arena — the typed block-local memory opcodes read and write.
//!
//! The arena is a flat list of typed slots sized by the compiled program's
//! layout. Audio slots hold `block_size` planar f32 samples per channel,
//! control slots hold one (krate) or `block_size` (arate) samples, and event
//! slots hold a bounded offset-ordered event list.
//!
//! The arena is rebuilt only on a program swap; within a program's lifetime
//! every block reuses the same memory and the executor performs no arena
//! allocation. Distinct port bindings never alias unless the compiler mapped
//! an input directly onto its producer's buffer.

use crate::event::{Event, MAX_EVENTS_PER_BLOCK};

/// The shape of one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Planar audio, `channels * block_size` samples.
    Audio {
        /// Channel count (1 or 2).
        channels: usize,
    },
    /// One f32 per block.
    ControlKrate,
    /// `block_size` f32 samples.
    ControlArate,
    /// Bounded ordered event list.
    Event,
}

impl BufferKind {
    /// Sample storage required for this kind at a given block size.
    pub fn sample_len(self, block_size: usize) -> usize {
        match self {
            BufferKind::Audio { channels } => channels * block_size,
            BufferKind::ControlKrate => 1,
            BufferKind::ControlArate => block_size,
            BufferKind::Event => 0,
        }
    }
}

/// One slot description inside a program's buffer layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSpec {
    /// Slot shape.
    pub kind: BufferKind,
}

/// One arena slot: sample storage and/or an event list, per its kind.
#[derive(Debug)]
struct Slot {
    kind: BufferKind,
    samples: Vec<f32>,
    events: Vec<Event>,
}

/// The executor-owned region of typed buffers backing port bindings.
#[derive(Debug)]
pub struct BufferArena {
    slots: Vec<Slot>,
    block_size: usize,
    generation: u64,
}

impl BufferArena {
    /// Builds an arena matching a program layout. All slots start zeroed.
    pub fn from_layout(specs: &[BufferSpec], block_size: usize, generation: u64) -> Self {
        let slots = specs
            .iter()
            .map(|spec| Slot {
                kind: spec.kind,
                samples: vec![0.0; spec.kind.sample_len(block_size)],
                events: if spec.kind == BufferKind::Event {
                    Vec::with_capacity(MAX_EVENTS_PER_BLOCK)
                } else {
                    Vec::new()
                },
            })
            .collect();
        Self {
            slots,
            block_size,
            generation,
        }
    }

    /// Generation of the program this arena was built for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Block size the arena was sized for.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Kind of a slot.
    pub fn kind(&self, idx: usize) -> BufferKind {
        self.slots[idx].kind
    }

    /// Zero a slot (samples and events).
    pub fn clear(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.samples.fill(0.0);
        slot.events.clear();
    }

    /// Samples of a slot.
    #[inline]
    pub fn samples(&self, idx: usize) -> &[f32] {
        &self.slots[idx].samples
    }

    /// Mutable samples of a slot.
    #[inline]
    pub fn samples_mut(&mut self, idx: usize) -> &mut [f32] {
        &mut self.slots[idx].samples
    }

    /// Events of a slot.
    #[inline]
    pub fn events(&self, idx: usize) -> &[Event] {
        &self.slots[idx].events
    }

    /// Mutable event list of a slot.
    #[inline]
    pub fn events_mut(&mut self, idx: usize) -> &mut Vec<Event> {
        &mut self.slots[idx].events
    }

    /// Sum `src` samples into `dst` (audio / arate mix). No-op when aliased.
    pub fn mix(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let (s, d) = self.pair(src, dst);
        for (out, inp) in d.samples.iter_mut().zip(s.samples.iter()) {
            *out += *inp;
        }
    }

    /// Merge `src` events into `dst`, keeping `dst` ordered by offset.
    ///
    /// Overflow beyond the per-block event bound is dropped.
    pub fn merge_events(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let (s, d) = self.pair(src, dst);
        for ev in &s.events {
            if d.events.len() >= MAX_EVENTS_PER_BLOCK {
                tracing::warn!(slot = dst, "event buffer full, dropping merged events");
                break;
            }
            d.events.push(ev.clone());
        }
        d.events.sort_by_key(Event::offset);
    }

    /// Shared/mutable split borrow of two distinct slots: the source
    /// read-only and the destination mutable, without temporary copies.
    fn pair(&mut self, shared: usize, excl: usize) -> (&Slot, &mut Slot) {
        debug_assert_ne!(shared, excl);
        if shared < excl {
            let (lo, hi) = self.slots.split_at_mut(excl);
            (&lo[shared], &mut hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(shared);
            (&hi[0], &mut lo[excl])
        }
    }

    /// Immutable/mutable sample pair across two distinct slots.
    pub fn sample_pair(&mut self, shared: usize, excl: usize) -> (&[f32], &mut [f32]) {
        let (s, d) = self.pair(shared, excl);
        (&s.samples, &mut d.samples)
    }

    /// Two mutable sample slices across two distinct slots.
    pub fn sample_pair_mut(&mut self, a: usize, b: usize) -> (&mut [f32], &mut [f32]) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.slots.split_at_mut(b);
            (&mut lo[a].samples, &mut hi[0].samples)
        } else {
            let (lo, hi) = self.slots.split_at_mut(a);
            (&mut hi[0].samples, &mut lo[b].samples)
        }
    }
}

/// A node's view of the arena during one `CallNode`: its bound input and
/// output buffers, addressed by declared port position.
pub struct PortIo<'a> {
    arena: &'a mut BufferArena,
    inputs: &'a [usize],
    outputs: &'a [usize],
}

impl<'a> PortIo<'a> {
    /// Wrap the arena with a node's bindings.
    pub fn new(arena: &'a mut BufferArena, inputs: &'a [usize], outputs: &'a [usize]) -> Self {
        Self {
            arena,
            inputs,
            outputs,
        }
    }

    /// Number of bound input ports.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of bound output ports.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Samples of the nth input port.
    pub fn input(&self, port: usize) -> &[f32] {
        self.arena.samples(self.inputs[port])
    }

    /// First sample of the nth input port (krate control reads).
    pub fn input_control(&self, port: usize) -> f32 {
        self.arena.samples(self.inputs[port]).first().copied().unwrap_or(0.0)
    }

    /// Events of the nth input port.
    pub fn input_events(&self, port: usize) -> &[Event] {
        self.arena.events(self.inputs[port])
    }

    /// Mutable samples of the nth output port.
    pub fn output(&mut self, port: usize) -> &mut [f32] {
        self.arena.samples_mut(self.outputs[port])
    }

    /// Mutable event list of the nth output port.
    pub fn output_events(&mut self, port: usize) -> &mut Vec<Event> {
        self.arena.events_mut(self.outputs[port])
    }

    /// Read/write pair: nth input port and nth output port.
    ///
    /// The compiler never binds an output to its own input buffer, so the
    /// split borrow is always valid.
    pub fn in_out(&mut self, in_port: usize, out_port: usize) -> (&[f32], &mut [f32]) {
        self.arena
            .sample_pair(self.inputs[in_port], self.outputs[out_port])
    }

    /// Event read/write pair: nth input port and nth output port.
    pub fn events_in_out(&mut self, in_port: usize, out_port: usize) -> (&[Event], &mut Vec<Event>) {
        let (s, d) = self
            .arena
            .pair(self.inputs[in_port], self.outputs[out_port]);
        (&s.events, &mut d.events)
    }

    /// Two mutable output slices (e.g. left/right of a stereo pair).
    pub fn out_pair(&mut self, a: usize, b: usize) -> (&mut [f32], &mut [f32]) {
        self.arena.sample_pair_mut(self.outputs[a], self.outputs[b])
    }
}
