//! Restorable captures of blackboard and per-node state.

use std::collections::BTreeMap;
use std::time::Duration;

use bt_core::{BlackboardImage, NodeId, NodeStats, Status};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// When the manager captures snapshots on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    /// Only on explicit `take_snapshot` calls.
    #[default]
    Manual,
    /// After every `n` completed ticks.
    EveryTicks(u64),
    /// Whenever at least this much time passed since the last capture.
    EveryDuration(Duration),
}

/// Status and stats of one node at capture time.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub status: Status,
    pub stats: NodeStats,
}

/// A restorable view of the tree at a tick boundary: a deep copy of the
/// blackboard plus `(status, stats)` per node, keyed by node id.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: u64,
    pub tick_no: u64,
    pub timestamp: DateTime<Utc>,
    pub blackboard: BlackboardImage,
    pub nodes: BTreeMap<NodeId, NodeState>,
}
