//! Deliberately failing node for quarantine coverage.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamSpec, ParamValue, PortDescriptor,
    PortIo, PortType, Processor,
};

/// Descriptor for `builtin://crasher`: a mono source that fails after a
/// configurable number of blocks.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://crasher".into(),
        kind: NodeKind::Source,
        ports: vec![PortDescriptor::output("out", PortType::AudioMono)],
        params: vec![ParamSpec::float("after_blocks", 0.0, 1.0e9, 0.0)],
        latency: 0,
    }
}

/// Emits full-scale DC until its countdown expires, then fails every block.
pub struct Crasher {
    blocks_left: u64,
}

impl Crasher {
    /// Fail after `after_blocks` successful blocks.
    pub fn new(after_blocks: u64) -> Self {
        Self {
            blocks_left: after_blocks,
        }
    }
}

impl Processor for Crasher {
    fn process_block(
        &mut self,
        _ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        if self.blocks_left == 0 {
            return Err(NodeError::Process("crasher expired".into()));
        }
        self.blocks_left -= 1;
        io.output(0).fill(1.0);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError> {
        match name {
            "after_blocks" => {
                let v = value
                    .as_float()
                    .ok_or_else(|| NodeError::TypeMismatch(name.to_owned()))?;
                self.blocks_left = v.max(0.0) as u64;
                Ok(())
            }
            _ => Err(NodeError::UnknownParameter(name.to_owned())),
        }
    }
}
