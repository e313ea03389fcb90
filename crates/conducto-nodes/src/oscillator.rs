//! Sine oscillator source.

use std::f32::consts::TAU;

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamSpec, ParamValue, PortDescriptor,
    PortIo, PortType, Processor,
};

/// Descriptor for `builtin://sine`: stereo-paired mono outputs, frequency and
/// amplitude parameters.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://sine".into(),
        kind: NodeKind::Source,
        ports: vec![
            PortDescriptor::output("out:left", PortType::AudioMono),
            PortDescriptor::output("out:right", PortType::AudioMono),
        ],
        params: vec![
            ParamSpec::float("freq", 1.0, 20000.0, 440.0),
            ParamSpec::float("amp", 0.0, 1.0, 0.5),
        ],
        latency: 0,
    }
}

/// Phase-accumulator sine source writing the same signal to both outputs.
pub struct SineOscillator {
    freq: f32,
    amp: f32,
    phase: f32,
}

impl SineOscillator {
    /// New oscillator at the given frequency and amplitude.
    pub fn new(freq: f32, amp: f32) -> Self {
        Self {
            freq,
            amp,
            phase: 0.0,
        }
    }
}

impl Processor for SineOscillator {
    fn process_block(
        &mut self,
        ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let step = self.freq / ctxt.sample_rate as f32;
        let (left, right) = io.out_pair(0, 1);
        for i in 0..ctxt.block_size {
            let sample = (self.phase * TAU).sin() * self.amp;
            left[i] = sample;
            right[i] = sample;
            self.phase += step;
            if self.phase >= 1.0 {
                self.phase -= 1.0;
            }
        }
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError> {
        let v = value
            .as_float()
            .ok_or_else(|| NodeError::TypeMismatch(name.to_owned()))?;
        match name {
            "freq" => self.freq = v,
            "amp" => self.amp = v,
            _ => return Err(NodeError::UnknownParameter(name.to_owned())),
        }
        Ok(())
    }
}
