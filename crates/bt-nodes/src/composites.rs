//! Composites: ordered multi-child control flow.
//!
//! All composites honor the memory policy: `Persistent` resumes from the
//! last progressing child after a `Running` tick, `Fresh` restarts from the
//! first child on every tick. `Error` from a child propagates upward and is
//! treated by parents exactly like `Failure`.

use std::str::FromStr;

use async_trait::async_trait;
use bt_core::{Behavior, Node, SplitMix64, Status, TickCtx};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::leaves::ParseError;

/// Whether a composite remembers its progress across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryPolicy {
    Persistent,
    #[default]
    Fresh,
}

impl FromStr for MemoryPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PERSISTENT" => Ok(MemoryPolicy::Persistent),
            "FRESH" => Ok(MemoryPolicy::Fresh),
            other => Err(ParseError(other.to_string())),
        }
    }
}

/// Ticks children in order; the first `Failure` fails the whole sequence,
/// all `Success` succeeds it.
pub struct Sequence {
    policy: MemoryPolicy,
    skip_errors: bool,
    index: usize,
}

impl Sequence {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self {
            policy,
            skip_errors: false,
            index: 0,
        }
    }

    /// Step over erroring children instead of propagating the error.
    pub fn with_skip_errors(mut self) -> Self {
        self.skip_errors = true;
        self
    }

    pub fn node(
        self,
        name: impl Into<String>,
        children: Vec<Node>,
    ) -> Result<Node, bt_core::TreeError> {
        Node::new(name, Box::new(self)).with_children(children)
    }
}

#[async_trait]
impl Behavior for Sequence {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if ctx.children.is_empty() {
            return Ok(Status::Success);
        }
        if self.policy == MemoryPolicy::Fresh || self.index >= ctx.children.len() {
            self.index = 0;
        }

        while self.index < ctx.children.len() {
            match ctx.children[self.index].tick().await {
                Status::Running => return Ok(Status::Running),
                Status::Failure => {
                    self.index = 0;
                    return Ok(Status::Failure);
                }
                Status::Error if !self.skip_errors => {
                    self.index = 0;
                    return Ok(Status::Error);
                }
                Status::Success | Status::Error | Status::Invalid => self.index += 1,
            }
        }

        self.index = 0;
        Ok(Status::Success)
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

/// Dual of [`Sequence`]: the first `Success` short-circuits, all `Failure`
/// fails.
pub struct Selector {
    policy: MemoryPolicy,
    index: usize,
}

impl Selector {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self { policy, index: 0 }
    }

    pub fn node(
        self,
        name: impl Into<String>,
        children: Vec<Node>,
    ) -> Result<Node, bt_core::TreeError> {
        Node::new(name, Box::new(self)).with_children(children)
    }
}

#[async_trait]
impl Behavior for Selector {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if ctx.children.is_empty() {
            return Ok(Status::Failure);
        }
        if self.policy == MemoryPolicy::Fresh || self.index >= ctx.children.len() {
            self.index = 0;
        }

        while self.index < ctx.children.len() {
            match ctx.children[self.index].tick().await {
                Status::Running => return Ok(Status::Running),
                Status::Success => {
                    self.index = 0;
                    return Ok(Status::Success);
                }
                Status::Failure | Status::Error | Status::Invalid => self.index += 1,
            }
        }

        self.index = 0;
        Ok(Status::Failure)
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

/// Like [`Sequence`] but re-evaluates every prior child on each tick; any
/// prior `Failure` aborts immediately. Used for guarded actions.
pub struct ReactiveSequence {
    running: Option<usize>,
}

impl ReactiveSequence {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { running: None }
    }

    pub fn node(
        self,
        name: impl Into<String>,
        children: Vec<Node>,
    ) -> Result<Node, bt_core::TreeError> {
        Node::new(name, Box::new(self)).with_children(children)
    }
}

#[async_trait]
impl Behavior for ReactiveSequence {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        for i in 0..ctx.children.len() {
            match ctx.children[i].tick().await {
                Status::Success => continue,
                Status::Running => {
                    if self.running != Some(i) {
                        if let Some(prev) = self.running {
                            if prev < ctx.children.len() {
                                ctx.children[prev].cancel();
                                ctx.children[prev].reset();
                            }
                        }
                        self.running = Some(i);
                    }
                    return Ok(Status::Running);
                }
                status => {
                    self.running = None;
                    return Ok(status);
                }
            }
        }

        self.running = None;
        Ok(Status::Success)
    }

    fn reset(&mut self) {
        self.running = None;
    }
}

/// Dual of [`ReactiveSequence`]: any prior `Success` short-circuits,
/// including re-activation of an earlier child.
pub struct ReactiveSelector {
    running: Option<usize>,
}

impl ReactiveSelector {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { running: None }
    }

    pub fn node(
        self,
        name: impl Into<String>,
        children: Vec<Node>,
    ) -> Result<Node, bt_core::TreeError> {
        Node::new(name, Box::new(self)).with_children(children)
    }
}

#[async_trait]
impl Behavior for ReactiveSelector {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        for i in 0..ctx.children.len() {
            match ctx.children[i].tick().await {
                Status::Failure | Status::Error | Status::Invalid => continue,
                Status::Success => {
                    if let Some(prev) = self.running {
                        if prev != i && prev < ctx.children.len() {
                            ctx.children[prev].cancel();
                            ctx.children[prev].reset();
                        }
                    }
                    self.running = None;
                    return Ok(Status::Success);
                }
                Status::Running => {
                    if self.running != Some(i) {
                        if let Some(prev) = self.running {
                            if prev < ctx.children.len() {
                                ctx.children[prev].cancel();
                                ctx.children[prev].reset();
                            }
                        }
                        self.running = Some(i);
                    }
                    return Ok(Status::Running);
                }
            }
        }

        self.running = None;
        Ok(Status::Failure)
    }

    fn reset(&mut self) {
        self.running = None;
    }
}

/// Selector that shuffles its child order once per round. A round begins at
/// `Invalid` (first tick, after reset) or after a terminal result.
pub struct RandomSelector {
    rng: SplitMix64,
    order: Vec<usize>,
    cursor: usize,
}

impl RandomSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SplitMix64::new(seed),
            order: Vec::new(),
            cursor: 0,
        }
    }

    pub fn node(
        self,
        name: impl Into<String>,
        children: Vec<Node>,
    ) -> Result<Node, bt_core::TreeError> {
        Node::new(name, Box::new(self)).with_children(children)
    }

    fn end_round(&mut self) {
        self.order.clear();
        self.cursor = 0;
    }
}

#[async_trait]
impl Behavior for RandomSelector {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if ctx.children.is_empty() {
            return Ok(Status::Failure);
        }
        if self.order.len() != ctx.children.len() {
            self.order = (0..ctx.children.len()).collect();
            self.rng.shuffle(&mut self.order);
            self.cursor = 0;
        }

        while self.cursor < self.order.len() {
            let child_index = self.order[self.cursor];
            match ctx.children[child_index].tick().await {
                Status::Running => return Ok(Status::Running),
                Status::Success => {
                    self.end_round();
                    return Ok(Status::Success);
                }
                Status::Failure | Status::Error | Status::Invalid => self.cursor += 1,
            }
        }

        self.end_round();
        Ok(Status::Failure)
    }

    fn reset(&mut self) {
        self.end_round();
    }
}

/// Decision policy for [`Parallel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParallelPolicy {
    /// All children must succeed; any failure fails the composite.
    RequireAll,
    /// One success suffices; all must fail for the composite to fail.
    RequireOne,
    /// Runs everything to completion; succeeds only when every child did.
    SequenceStar,
    /// Runs everything to completion; succeeds when at least one child did.
    SelectorStar,
}

impl FromStr for ParallelPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUIRE_ALL" => Ok(ParallelPolicy::RequireAll),
            "REQUIRE_ONE" => Ok(ParallelPolicy::RequireOne),
            "SEQUENCE_STAR" => Ok(ParallelPolicy::SequenceStar),
            "SELECTOR_STAR" => Ok(ParallelPolicy::SelectorStar),
            other => Err(ParseError(other.to_string())),
        }
    }
}

/// Ticks all non-terminal children concurrently each tick and decides per
/// policy.
///
/// `Error` counts as `Failure` for threshold purposes; the producing node
/// already emitted its own `Error` event. When a decision falls while some
/// children are still `Running`, those children receive `cancel()` and
/// `reset()`. The decision is sticky: further ticks return it unchanged
/// until the composite is reset.
pub struct Parallel {
    policy: ParallelPolicy,
    success_threshold: Option<usize>,
    failure_threshold: Option<usize>,
    synchronized: bool,
    statuses: Vec<Status>,
    decided: Option<Status>,
}

impl Parallel {
    pub fn new(policy: ParallelPolicy) -> Self {
        Self {
            policy,
            success_threshold: None,
            failure_threshold: None,
            synchronized: false,
            statuses: Vec::new(),
            decided: None,
        }
    }

    /// Overrides the policy's default success count.
    pub fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Overrides the policy's default failure count.
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Defer any decision until all children reach a terminal state within
    /// the same tick.
    pub fn with_synchronized(mut self) -> Self {
        self.synchronized = true;
        self
    }

    pub fn node(
        self,
        name: impl Into<String>,
        children: Vec<Node>,
    ) -> Result<Node, bt_core::TreeError> {
        Node::new(name, Box::new(self)).with_children(children)
    }

    /// Success wins the tie-break when both thresholds are met in the same
    /// tick, so it is checked first throughout.
    fn evaluate(&self, child_count: usize) -> Option<Status> {
        let successes = self
            .statuses
            .iter()
            .filter(|s| **s == Status::Success)
            .count();
        let failures = self
            .statuses
            .iter()
            .filter(|s| matches!(s, Status::Failure | Status::Error))
            .count();
        let any_running = self.statuses.iter().any(|s| !s.is_terminal());

        if self.synchronized && any_running {
            return None;
        }
        if let Some(threshold) = self.success_threshold {
            if successes >= threshold {
                return Some(Status::Success);
            }
        }
        if let Some(threshold) = self.failure_threshold {
            if failures >= threshold {
                return Some(Status::Failure);
            }
        }

        match self.policy {
            ParallelPolicy::RequireAll => {
                if failures > 0 {
                    Some(Status::Failure)
                } else if any_running {
                    None
                } else {
                    Some(Status::Success)
                }
            }
            ParallelPolicy::RequireOne => {
                if successes > 0 {
                    Some(Status::Success)
                } else if any_running {
                    None
                } else {
                    Some(Status::Failure)
                }
            }
            ParallelPolicy::SequenceStar => {
                if any_running {
                    None
                } else if successes == child_count {
                    Some(Status::Success)
                } else {
                    Some(Status::Failure)
                }
            }
            ParallelPolicy::SelectorStar => {
                if any_running {
                    None
                } else if successes > 0 {
                    Some(Status::Success)
                } else {
                    Some(Status::Failure)
                }
            }
        }
    }
}

#[async_trait]
impl Behavior for Parallel {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if let Some(decided) = self.decided {
            return Ok(decided);
        }
        let child_count = ctx.children.len();
        if child_count == 0 {
            return Ok(Status::Success);
        }
        if self.statuses.len() != child_count || self.synchronized {
            self.statuses = vec![Status::Invalid; child_count];
        }

        let pending: Vec<usize> = (0..child_count)
            .filter(|i| !self.statuses[*i].is_terminal())
            .collect();
        let results = join_all(
            ctx.children
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| pending.contains(i))
                .map(|(i, child)| async move { (i, child.tick().await) }),
        )
        .await;
        for (i, status) in results {
            self.statuses[i] = status;
        }

        match self.evaluate(child_count) {
            Some(decision) => {
                for (i, child) in ctx.children.iter_mut().enumerate() {
                    if !self.statuses[i].is_terminal() {
                        child.cancel();
                        child.reset();
                    }
                }
                self.decided = Some(decision);
                Ok(decision)
            }
            None => Ok(Status::Running),
        }
    }

    fn reset(&mut self) {
        self.statuses.clear();
        self.decided = None;
    }
}
