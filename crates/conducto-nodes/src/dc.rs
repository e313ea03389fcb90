//! Constant (DC) source.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamSpec, ParamValue, PortDescriptor,
    PortIo, PortType, Processor,
};

/// Descriptor for `builtin://dc`: a mono source holding a constant value.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://dc".into(),
        kind: NodeKind::Source,
        ports: vec![PortDescriptor::output("out", PortType::AudioMono)],
        params: vec![ParamSpec::float("value", -1.0, 1.0, 0.0)],
        latency: 0,
    }
}

/// Emits a constant sample value.
pub struct DcSource {
    value: f32,
}

impl DcSource {
    /// New constant source.
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Processor for DcSource {
    fn process_block(
        &mut self,
        _ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        io.output(0).fill(self.value);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError> {
        match name {
            "value" => {
                self.value = value
                    .as_float()
                    .ok_or_else(|| NodeError::TypeMismatch(name.to_owned()))?;
                Ok(())
            }
            _ => Err(NodeError::UnknownParameter(name.to_owned())),
        }
    }
}
