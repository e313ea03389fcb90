//! Two mono channels → stereo.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamValue, PortDescriptor, PortIo,
    PortType, Processor,
};

/// Descriptor for `builtin://join`: two mono inputs, one stereo output.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://join".into(),
        kind: NodeKind::Filter,
        ports: vec![
            PortDescriptor::input("in:left", PortType::AudioMono),
            PortDescriptor::input("in:right", PortType::AudioMono),
            PortDescriptor::output("out", PortType::AudioStereo),
        ],
        params: vec![],
        latency: 0,
    }
}

/// Packs left/right mono buffers into one planar stereo buffer.
pub struct JoinChannels;

impl Processor for JoinChannels {
    fn process_block(
        &mut self,
        ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let n = ctxt.block_size;
        let (left, stereo) = io.in_out(0, 0);
        stereo[..n].copy_from_slice(left);
        let (right, stereo) = io.in_out(1, 0);
        stereo[n..2 * n].copy_from_slice(right);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, _value: &ParamValue) -> Result<(), NodeError> {
        Err(NodeError::UnknownParameter(name.to_owned()))
    }
}
