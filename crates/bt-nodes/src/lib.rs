//! Leaf, decorator, and composite behaviors for the behavior tree runtime.

#![forbid(unsafe_code)]

pub mod composites;
pub mod decorators;
pub mod leaves;

pub use composites::{
    MemoryPolicy, Parallel, ParallelPolicy, RandomSelector, ReactiveSelector, ReactiveSequence,
    Selector, Sequence,
};
pub use decorators::{
    Cooldown, Delay, ForceFailure, ForceSuccess, Inverter, Repeat, Retry, Timeout,
};
pub use leaves::{
    Action, ActionCtx, ActionFn, ActionResult, BlackboardDelete, BlackboardSet, CompareOp,
    Condition, ConditionCtx, ConditionFn, DebugLog, EventEmit, LogLevel, ParseError, RunStats,
    Throttle, TimedCondition, Wait,
};
