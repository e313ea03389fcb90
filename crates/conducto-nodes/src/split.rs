//! Stereo → two mono channels.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamValue, PortDescriptor, PortIo,
    PortType, Processor,
};

/// Descriptor for `builtin://split`: one stereo input, two mono outputs.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://split".into(),
        kind: NodeKind::Filter,
        ports: vec![
            PortDescriptor::input("in", PortType::AudioStereo),
            PortDescriptor::output("out:left", PortType::AudioMono),
            PortDescriptor::output("out:right", PortType::AudioMono),
        ],
        params: vec![],
        latency: 0,
    }
}

/// Splits a planar stereo buffer into left/right mono buffers.
pub struct SplitChannels;

impl Processor for SplitChannels {
    fn process_block(
        &mut self,
        ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let n = ctxt.block_size;
        let (stereo, left) = io.in_out(0, 0);
        left.copy_from_slice(&stereo[..n]);
        let (stereo, right) = io.in_out(0, 1);
        right.copy_from_slice(&stereo[n..2 * n]);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, _value: &ParamValue) -> Result<(), NodeError> {
        Err(NodeError::UnknownParameter(name.to_owned()))
    }
}
