//! Null backend — simulated clock, no device.
//!
//! Drives the block cadence from a wall-clock timer (or free-runs when
//! unpaced), optionally captures delivered frames for assertions, and stops
//! itself after a configured frame budget. Used for headless operation,
//! integration tests, and perf runs.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use conducto_core::{Backend, BackendError, BlockContext, Event, EventInbox};

/// Shared handle to frames captured by a [`NullBackend`].
#[derive(Clone, Default)]
pub struct CaptureHandle {
    channels: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl CaptureHandle {
    /// New empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of one channel's captured samples.
    pub fn channel(&self, idx: usize) -> Vec<f32> {
        self.channels
            .lock()
            .get(idx)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of channels seen so far.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn append(&self, channel: usize, samples: &[f32]) {
        let mut chans = self.channels.lock();
        if channel >= chans.len() {
            chans.resize_with(channel + 1, Vec::new);
        }
        chans[channel].extend_from_slice(samples);
    }
}

/// Backend that produces cadence from a simulated clock.
pub struct NullBackend {
    inbox: EventInbox,
    capture: Option<CaptureHandle>,
    paced: bool,
    next_deadline: Option<Instant>,
    frames_run: u64,
    max_frames: Option<u64>,
    stopped: bool,
}

impl NullBackend {
    /// New null backend. `paced` sleeps one block period per frame; unpaced
    /// backends free-run (tests, offline perf).
    pub fn new(inbox: EventInbox, paced: bool) -> Self {
        Self {
            inbox,
            capture: None,
            paced,
            next_deadline: None,
            frames_run: 0,
            max_frames: None,
            stopped: false,
        }
    }

    /// Stop automatically after `frames` blocks.
    pub fn with_max_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    /// Capture delivered output into the returned handle.
    pub fn with_capture(mut self) -> (Self, CaptureHandle) {
        let handle = CaptureHandle::new();
        self.capture = Some(handle.clone());
        (self, handle)
    }

    /// Blocks completed so far.
    pub fn frames_run(&self) -> u64 {
        self.frames_run
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn begin_frame(&mut self, ctxt: &mut BlockContext) -> Result<(), BackendError> {
        if let Some(max) = self.max_frames
            && self.frames_run >= max
        {
            self.stopped = true;
            return Ok(());
        }

        if self.paced {
            let period = ctxt.block_duration();
            let deadline = self
                .next_deadline
                .unwrap_or_else(Instant::now);
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.next_deadline = Some(deadline.max(now) + period);
        }

        for (queue, event) in self.inbox.drain() {
            ctxt.add_event(&queue, event);
        }
        Ok(())
    }

    fn output(&mut self, channel: usize, samples: &[f32]) -> Result<(), BackendError> {
        if let Some(capture) = &self.capture {
            capture.append(channel, samples);
        }
        Ok(())
    }

    fn end_frame(&mut self, _ctxt: &mut BlockContext) -> Result<(), BackendError> {
        self.frames_run += 1;
        Ok(())
    }

    fn add_event(&mut self, queue: &str, event: Event) -> Result<(), BackendError> {
        self.inbox.push(queue, event);
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn stopped(&self) -> bool {
        self.stopped
    }
}
