//! Core primitives of the behavior tree runtime.

#![forbid(unsafe_code)]

pub mod blackboard;
pub mod client;
pub mod error;
pub mod event;
pub mod node;
pub mod rng;
pub mod status;

pub use blackboard::{
    ActivityOp, ActivityRecord, Blackboard, BlackboardImage, Entry, SubscriptionId,
    DEFAULT_NAMESPACE,
};
pub use client::{BlackboardClient, ClientScope};
pub use error::{BlackboardError, TreeError};
pub use event::{Event, EventBus, EventKind, ListenerId};
pub use node::{Behavior, Node, NodeId, NodeStats, Predicate, SetupCtx, TickCtx};
pub use rng::SplitMix64;
pub use status::Status;
