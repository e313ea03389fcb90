//! IPC backend — block exchange over a shared-memory region.
//!
//! Each block is interleaved into the region and published by bumping the
//! block counter; the header epoch tracks the program generation so a
//! consumer that missed a swap can re-synchronise. Cadence is wall-clock
//! paced: a cooperating consumer is expected to poll the counter at least as
//! fast as real time.

use std::time::Instant;

use conducto_core::{Backend, BackendError, BlockContext, Event, EventInbox};

use crate::shm::ShmRegion;

/// Backend publishing blocks into a named shared-memory region.
pub struct IpcBackend {
    inbox: EventInbox,
    region: ShmRegion,
    staging: Vec<Vec<f32>>,
    interleaved: Vec<f32>,
    next_deadline: Option<Instant>,
    stopped: bool,
}

impl IpcBackend {
    /// Create the named region and start publishing.
    pub fn new(
        inbox: EventInbox,
        region_name: &str,
        block_size: usize,
        channels: usize,
        sample_rate: u32,
    ) -> Result<Self, BackendError> {
        let region = ShmRegion::create(region_name, block_size, channels, sample_rate)?;
        tracing::info!(region = region_name, block_size, channels, "ipc backend started");
        Ok(Self {
            inbox,
            region,
            staging: vec![Vec::new(); channels],
            interleaved: vec![0.0; block_size * channels],
            next_deadline: None,
            stopped: false,
        })
    }

    /// The region this backend publishes into.
    pub fn region(&self) -> &ShmRegion {
        &self.region
    }
}

impl Backend for IpcBackend {
    fn name(&self) -> &str {
        "ipc"
    }

    fn begin_frame(&mut self, ctxt: &mut BlockContext) -> Result<(), BackendError> {
        // Pace to real time; the consumer polls the counter.
        let period = ctxt.block_duration();
        let deadline = self.next_deadline.unwrap_or_else(Instant::now);
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + period);

        for (queue, event) in self.inbox.drain() {
            ctxt.add_event(&queue, event);
        }
        Ok(())
    }

    fn output(&mut self, channel: usize, samples: &[f32]) -> Result<(), BackendError> {
        if let Some(slot) = self.staging.get_mut(channel) {
            slot.clear();
            slot.extend_from_slice(samples);
        }
        Ok(())
    }

    fn end_frame(&mut self, ctxt: &mut BlockContext) -> Result<(), BackendError> {
        // Stale consumers detect program swaps through the epoch field.
        if self.region.epoch() != ctxt.generation {
            self.region.set_epoch(ctxt.generation);
        }

        let channels = self.staging.len();
        for i in 0..ctxt.block_size {
            for (c, channel) in self.staging.iter().enumerate() {
                self.interleaved[i * channels + c] = channel.get(i).copied().unwrap_or(0.0);
            }
        }
        self.region.publish_block(&self.interleaved);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRegion;

    #[test]
    fn publishes_blocks_with_epoch() {
        let name = format!("conducto-test-ipc-{}", std::process::id());
        let mut backend = IpcBackend::new(EventInbox::new(), &name, 4, 2, 44100).unwrap();
        let mut ctxt = BlockContext::new(4, 44100, false);
        ctxt.generation = 3;

        backend.begin_frame(&mut ctxt).unwrap();
        backend.output(0, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        backend.output(1, &[-0.1, -0.2, -0.3, -0.4]).unwrap();
        backend.end_frame(&mut ctxt).unwrap();

        let consumer = ShmRegion::open(&name).unwrap();
        assert_eq!(consumer.block_counter(), 1);
        assert_eq!(consumer.epoch(), 3);
        let block = consumer.read_block();
        assert_eq!(block[0], 0.1);
        assert_eq!(block[1], -0.1);
        assert_eq!(block[6], 0.4);
        assert_eq!(block[7], -0.4);
    }
}
