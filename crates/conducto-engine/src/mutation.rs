//! Observer records — the change and status stream pushed to sessions.
//!
//! Records carry plain ids and strings so they serialise cleanly over any
//! transport. Graph-change records are minimal (an observer reconstructs the
//! graph by applying them in order); status records relay what the executor
//! reported between blocks.

use serde::Serialize;

use conducto_core::{PerfSnapshot, StatusRecord};

/// One span inside a [`ObserverRecord::Perf`] record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfSpanRecord {
    /// Node the span was recorded for, if any.
    pub node: Option<u64>,
    /// Span label.
    pub label: String,
    /// Duration in nanoseconds.
    pub duration_ns: u64,
}

/// A record pushed asynchronously to every attached observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverRecord {
    /// A node entered the graph.
    AddNode {
        /// Node id.
        id: u64,
        /// Descriptor URI.
        uri: String,
    },
    /// A node (and every connection touching it) left the graph.
    RemoveNode {
        /// Node id.
        id: u64,
    },
    /// A connection was created.
    ConnectPorts {
        /// Source node.
        src_node: u64,
        /// Source port.
        src_port: String,
        /// Destination node.
        dst_node: u64,
        /// Destination port.
        dst_port: String,
        /// Resolved connection type name.
        ty: String,
    },
    /// A connection was removed.
    DisconnectPorts {
        /// Source node.
        src_node: u64,
        /// Source port.
        src_port: String,
        /// Destination node.
        dst_node: u64,
        /// Destination port.
        dst_port: String,
    },
    /// Per-node timing for one block.
    Perf {
        /// Absolute frame position of the measured block.
        sample_pos: u64,
        /// Spans in recording order.
        spans: Vec<PerfSpanRecord>,
    },
    /// A node-state notification (e.g. `end_of_stream`).
    NodeState {
        /// Node id.
        id: u64,
        /// State key.
        key: String,
        /// State value.
        value: String,
    },
    /// Cumulative xrun counter.
    XRun {
        /// Total xruns since engine start.
        count: u64,
    },
    /// A node was quarantined.
    NodeFailed {
        /// Node id.
        id: u64,
        /// Failure description.
        kind: String,
    },
}

impl ObserverRecord {
    /// Whether this record is gated by the session `perf` flag.
    pub fn is_perf(&self) -> bool {
        matches!(self, ObserverRecord::Perf { .. })
    }

    /// Convert an executor status record. `BackendLost` maps to a
    /// `NodeState` on the sink, matching the error-handling contract.
    pub fn from_status(status: StatusRecord, sink: u64) -> ObserverRecord {
        match status {
            StatusRecord::Perf(snapshot) => Self::from_perf(&snapshot),
            StatusRecord::NodeState { node, key, value } => ObserverRecord::NodeState {
                id: node.raw(),
                key,
                value,
            },
            StatusRecord::NodeFailed { node, kind } => ObserverRecord::NodeFailed {
                id: node.raw(),
                kind,
            },
            StatusRecord::XRun { count } => ObserverRecord::XRun { count },
            StatusRecord::BackendLost { reason } => ObserverRecord::NodeState {
                id: sink,
                key: "backend".into(),
                value: format!("lost: {reason}"),
            },
        }
    }

    fn from_perf(snapshot: &PerfSnapshot) -> ObserverRecord {
        ObserverRecord::Perf {
            sample_pos: snapshot.sample_pos,
            spans: snapshot
                .spans
                .iter()
                .map(|s| PerfSpanRecord {
                    node: s.node.map(|n| n.raw()),
                    label: s.label.clone(),
                    duration_ns: s.duration_ns(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conducto_core::NodeId;

    #[test]
    fn backend_lost_lands_on_sink() {
        let record = ObserverRecord::from_status(
            StatusRecord::BackendLost {
                reason: "device unplugged".into(),
            },
            0,
        );
        assert!(matches!(
            record,
            ObserverRecord::NodeState { id: 0, ref key, .. } if key == "backend"
        ));
    }

    #[test]
    fn perf_flag_detection() {
        let perf = ObserverRecord::from_status(
            StatusRecord::Perf(PerfSnapshot::default()),
            0,
        );
        assert!(perf.is_perf());

        let failed = ObserverRecord::from_status(
            StatusRecord::NodeFailed {
                node: NodeId::from_raw(2),
                kind: "boom".into(),
            },
            0,
        );
        assert!(!failed.is_perf());
    }

    #[test]
    fn records_serialise() {
        let record = ObserverRecord::AddNode {
            id: 3,
            uri: "builtin://sine".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"add_node\""));
        assert!(json.contains("builtin://sine"));
    }
}
