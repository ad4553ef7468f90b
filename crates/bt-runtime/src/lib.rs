//! Tree manager for the behavior tree runtime: tick scheduling, descriptor
//! loading, execution stats, and restorable snapshots.

#![forbid(unsafe_code)]

pub mod context;
pub mod descriptor;
pub mod manager;
pub mod snapshot;

pub use context::{ExecutionContext, TickRecord};
pub use descriptor::{ConfigError, LeafRegistry, NodeSpec, TreeBuilder};
pub use manager::{ControlHandle, ManagerConfig, TreeManager};
pub use snapshot::{NodeState, Snapshot, SnapshotPolicy};
