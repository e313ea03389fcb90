//! Event source fed from a named external queue.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamValue, PortDescriptor, PortIo,
    PortType, Processor,
};

/// Descriptor for `builtin://event_source`, bound to a logical queue name.
///
/// The input port carries a stream property, so the compiler emits a
/// `FetchBuffer` pulling the backend queue into it each block.
pub fn descriptor(queue: &str) -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://event_source".into(),
        kind: NodeKind::EventSource,
        ports: vec![
            PortDescriptor::event_input_stream("in", queue),
            PortDescriptor::output("out", PortType::Event),
        ],
        params: vec![],
        latency: 0,
    }
}

/// Forwards fetched events to the output port.
pub struct EventSource;

impl Processor for EventSource {
    fn process_block(
        &mut self,
        _ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let (events, out) = io.events_in_out(0, 0);
        out.clear();
        out.extend_from_slice(events);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, _value: &ParamValue) -> Result<(), NodeError> {
        Err(NodeError::UnknownParameter(name.to_owned()))
    }
}
