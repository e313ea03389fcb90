//! Mono passthrough.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamValue, PortDescriptor, PortIo,
    PortType, Processor,
};

/// Descriptor for `builtin://passthru`.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://passthru".into(),
        kind: NodeKind::Filter,
        ports: vec![
            PortDescriptor::input("in", PortType::AudioMono),
            PortDescriptor::output("out", PortType::AudioMono),
        ],
        params: vec![],
        latency: 0,
    }
}

/// Copies input to output unchanged.
pub struct PassThru;

impl Processor for PassThru {
    fn process_block(
        &mut self,
        _ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let (inp, out) = io.in_out(0, 0);
        out.copy_from_slice(inp);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, _value: &ParamValue) -> Result<(), NodeError> {
        Err(NodeError::UnknownParameter(name.to_owned()))
    }
}
