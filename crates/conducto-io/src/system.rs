//! System backend — cpal output stream.
//!
//! The cpal stream handle is not `Send`, so a dedicated thread builds and
//! owns it for the backend's whole life; the backend struct itself carries
//! only channels and can move onto the engine's audio thread freely.
//!
//! Data path: `output()` stages planar channels, `end_frame()` interleaves
//! them and performs a blocking send into a bounded sample FIFO that the
//! device callback drains. The blocking send is the cadence — the engine
//! thread runs exactly as fast as the device consumes, and the device
//! callback itself never touches the executor.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded};

use conducto_core::{Backend, BackendError, BlockContext, Event, EventInbox};

/// Configuration for the system backend.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Output device name; system default when `None`.
    pub device: Option<String>,
    /// Requested sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    /// Output channels (the engine sink is stereo).
    pub channels: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 44100,
            block_size: 256,
            channels: 2,
        }
    }
}

/// cpal-backed output driver.
pub struct SystemBackend {
    inbox: EventInbox,
    channels: usize,
    staging: Vec<Vec<f32>>,
    fifo: Sender<f32>,
    /// Signals the stream-owner thread to drop the stream and exit.
    stop_tx: Sender<()>,
    stopped: bool,
}

impl SystemBackend {
    /// Build the device stream (on its own owner thread) and start playback.
    pub fn new(inbox: EventInbox, config: SystemConfig) -> Result<Self, BackendError> {
        // Four blocks of slack between the engine thread and the device.
        let capacity = config.block_size * config.channels * 4;
        let (fifo_tx, fifo_rx): (Sender<f32>, Receiver<f32>) = bounded(capacity);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let owner_config = config.clone();
        std::thread::Builder::new()
            .name("conducto-cpal".into())
            .spawn(move || stream_owner(owner_config, fifo_rx, stop_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(BackendError::Lost(message)),
            Err(_) => return Err(BackendError::Lost("stream owner thread died".into())),
        }

        tracing::info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            channels = config.channels,
            "system backend started"
        );

        Ok(Self {
            inbox,
            channels: config.channels,
            staging: vec![Vec::new(); config.channels],
            fifo: fifo_tx,
            stop_tx,
            stopped: false,
        })
    }
}

/// Runs on the dedicated owner thread: builds the stream, reports readiness,
/// and keeps the stream alive until stop (or backend drop) is signalled.
fn stream_owner(
    config: SystemConfig,
    fifo_rx: Receiver<f32>,
    stop_rx: Receiver<()>,
    ready_tx: Sender<Result<(), String>>,
) {
    let build = || -> Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = match &config.device {
            Some(name) => host
                .output_devices()
                .map_err(|e| e.to_string())?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| format!("output device {name:?} not found"))?,
            None => host
                .default_output_device()
                .ok_or_else(|| "no output device available".to_owned())?,
        };

        let stream_config = cpal::StreamConfig {
            channels: config.channels as u16,
            sample_rate: config.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(config.block_size as u32),
        };

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        // Underruns play silence; the engine reports xruns
                        // through its own timing, not from here.
                        *sample = fifo_rx.try_recv().unwrap_or(0.0);
                    }
                },
                |err| tracing::error!(error = %err, "output stream error"),
                None,
            )
            .map_err(|e| e.to_string())?;
        stream.play().map_err(|e| e.to_string())?;
        Ok(stream)
    };

    match build() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            // Block until the backend stops or is dropped, then release.
            let _ = stop_rx.recv();
            drop(stream);
        }
        Err(message) => {
            let _ = ready_tx.send(Err(message));
        }
    }
}

impl Backend for SystemBackend {
    fn name(&self) -> &str {
        "system"
    }

    fn begin_frame(&mut self, ctxt: &mut BlockContext) -> Result<(), BackendError> {
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
        // Interleave and block until the device has drained enough; this is
        // where the device paces the engine thread.
        for i in 0..ctxt.block_size {
            for channel in 0..self.channels {
                let sample = self
                    .staging
                    .get(channel)
                    .and_then(|c| c.get(i))
                    .copied()
                    .unwrap_or(0.0);
                if self.fifo.send(sample).is_err() {
                    self.stopped = true;
                    return Err(BackendError::Lost("output stream closed".into()));
                }
            }
        }
        Ok(())
    }

    fn add_event(&mut self, queue: &str, event: Event) -> Result<(), BackendError> {
        self.inbox.push(queue, event);
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
        let _ = self.stop_tx.try_send(());
    }

    fn stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for SystemBackend {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}
