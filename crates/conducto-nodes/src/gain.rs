//! Mono gain stage.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamSpec, ParamValue, PortDescriptor,
    PortIo, PortType, Processor,
};

/// Descriptor for `builtin://gain`: mono in/out with a `gain` parameter.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://gain".into(),
        kind: NodeKind::Filter,
        ports: vec![
            PortDescriptor::input("in", PortType::AudioMono),
            PortDescriptor::output("out", PortType::AudioMono),
        ],
        params: vec![ParamSpec::float("gain", 0.0, 4.0, 1.0)],
        latency: 0,
    }
}

/// Multiplies the input by a scalar gain.
pub struct Gain {
    gain: f32,
}

impl Gain {
    /// New gain stage.
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Processor for Gain {
    fn process_block(
        &mut self,
        _ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let (inp, out) = io.in_out(0, 0);
        for (o, i) in out.iter_mut().zip(inp.iter()) {
            *o = *i * self.gain;
        }
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError> {
        match name {
            "gain" => {
                self.gain = value
                    .as_float()
                    .ok_or_else(|| NodeError::TypeMismatch(name.to_owned()))?;
                Ok(())
            }
            _ => Err(NodeError::UnknownParameter(name.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conducto_core::{BufferArena, BufferKind, BufferSpec};

    #[test]
    fn scales_input() {
        let mut arena = BufferArena::from_layout(
            &[
                BufferSpec {
                    kind: BufferKind::Audio { channels: 1 },
                },
                BufferSpec {
                    kind: BufferKind::Audio { channels: 1 },
                },
            ],
            4,
            1,
        );
        arena.samples_mut(0).copy_from_slice(&[1.0, -1.0, 0.5, 0.0]);

        let mut ctxt = BlockContext::new(4, 44100, false);
        let inputs = [0usize];
        let outputs = [1usize];
        let mut io = PortIo::new(&mut arena, &inputs, &outputs);
        let mut gain = Gain::new(2.0);
        gain.process_block(&mut ctxt, &mut io).unwrap();

        assert_eq!(arena.samples(1), &[2.0, -2.0, 1.0, 0.0]);
    }

    #[test]
    fn parameter_roundtrip() {
        let mut gain = Gain::new(1.0);
        gain.set_parameter("gain", &ParamValue::Float(0.0)).unwrap();
        assert!(gain.set_parameter("mix", &ParamValue::Float(0.5)).is_err());
    }
}
