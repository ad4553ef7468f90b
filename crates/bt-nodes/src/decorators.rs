//! Decorators: single-child behaviors that transform the child's result or
//! govern its invocation. All of them report `Failure` when no child is
//! attached; the descriptor builder enforces exactly one at construction.

use std::time::Duration;

use async_trait::async_trait;
use bt_core::{Behavior, Node, SplitMix64, Status, TickCtx};
use tokio::time::Instant;

fn child<'c, 'a>(ctx: &'c mut TickCtx<'a>) -> Option<&'c mut Node> {
    ctx.children.first_mut()
}

/// Swaps `Success` and `Failure`; `Running` and `Error` pass through.
#[derive(Debug, Default)]
pub struct Inverter;

impl Inverter {
    pub fn node(name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(Self), child)
    }
}

#[async_trait]
impl Behavior for Inverter {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };
        Ok(match child.tick().await {
            Status::Success => Status::Failure,
            Status::Failure => Status::Success,
            other => other,
        })
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }
}

/// Coerces any terminal result to `Success`; `Running` passes through.
#[derive(Debug, Default)]
pub struct ForceSuccess;

impl ForceSuccess {
    pub fn node(name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(Self), child)
    }
}

#[async_trait]
impl Behavior for ForceSuccess {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };
        let status = child.tick().await;
        Ok(if status.is_terminal() {
            Status::Success
        } else {
            status
        })
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }
}

/// Coerces any terminal result to `Failure`; `Running` passes through.
#[derive(Debug, Default)]
pub struct ForceFailure;

impl ForceFailure {
    pub fn node(name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(Self), child)
    }
}

#[async_trait]
impl Behavior for ForceFailure {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };
        let status = child.tick().await;
        Ok(if status.is_terminal() {
            Status::Failure
        } else {
            status
        })
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }
}

/// Re-runs the child across ticks, counting completions. `Success` after
/// `count` successful completions; the first child `Failure` fails the
/// decorator unless `ignore_failure` is set (then it counts as a completion).
pub struct Repeat {
    count: u32,
    ignore_failure: bool,
    completions: u32,
    successes: u32,
}

impl Repeat {
    pub fn new(count: u32) -> Self {
        Self {
            count: count.max(1),
            ignore_failure: false,
            completions: 0,
            successes: 0,
        }
    }

    pub fn with_ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    pub fn node(self, name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(self), child)
    }

    fn clear(&mut self) {
        self.completions = 0;
        self.successes = 0;
    }
}

#[async_trait]
impl Behavior for Repeat {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };

        match child.tick().await {
            Status::Running => Ok(Status::Running),
            Status::Success => {
                self.completions += 1;
                self.successes += 1;
                if self.successes >= self.count {
                    self.clear();
                    Ok(Status::Success)
                } else {
                    child.reset();
                    Ok(Status::Running)
                }
            }
            Status::Failure if self.ignore_failure => {
                self.completions += 1;
                if self.completions >= self.count {
                    let met = self.successes >= self.count;
                    self.clear();
                    Ok(if met { Status::Success } else { Status::Failure })
                } else {
                    child.reset();
                    Ok(Status::Running)
                }
            }
            Status::Failure => {
                self.clear();
                Ok(Status::Failure)
            }
            other => {
                self.clear();
                Ok(other)
            }
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Re-ticks the child on `Failure`, waiting `delay` between attempts, all
/// within a single outer tick. `Success` short-circuits; exhausting
/// `max_attempts` yields `Failure`.
pub struct Retry {
    max_attempts: u32,
    delay: Duration,
    exponential_backoff: bool,
    jitter: f64,
    rng: SplitMix64,
}

impl Retry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            exponential_backoff: false,
            jitter: 0.0,
            rng: SplitMix64::new(0xBACC0FF),
        }
    }

    pub fn with_exponential_backoff(mut self) -> Self {
        self.exponential_backoff = true;
        self
    }

    /// Adds up to `jitter` seconds of deterministic noise to every delay.
    pub fn with_jitter(mut self, jitter: f64, seed: u64) -> Self {
        self.jitter = jitter.max(0.0);
        self.rng = SplitMix64::new(seed);
        self
    }

    pub fn node(self, name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(self), child)
    }

    fn delay_for(&mut self, attempt: u32) -> Duration {
        let mut secs = self.delay.as_secs_f64();
        if secs <= 0.0 && self.jitter <= 0.0 {
            return Duration::ZERO;
        }
        if self.exponential_backoff {
            secs *= 2f64.powi(attempt.saturating_sub(1) as i32);
        }
        if self.jitter > 0.0 {
            secs += (self.rng.next_f64_unit() * 2.0 - 1.0) * self.jitter;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[async_trait]
impl Behavior for Retry {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };

        let mut attempt = 0u32;
        loop {
            match child.tick().await {
                Status::Success => return Ok(Status::Success),
                Status::Running => return Ok(Status::Running),
                Status::Failure | Status::Error | Status::Invalid => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Ok(Status::Failure);
                    }
                    let delay = self.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    child.reset();
                }
            }
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }
}

/// Grants the child a cumulative wall-clock budget counted from its first
/// tick. On expiry the in-flight child tick is dropped, the child is
/// cancelled and reset, and the decorator reports `Failure`.
pub struct Timeout {
    budget: Duration,
    started: Option<Instant>,
}

impl Timeout {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: None,
        }
    }

    pub fn node(self, name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(self), child)
    }
}

#[async_trait]
impl Behavior for Timeout {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let node_name = ctx.node_name;
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };

        let started = *self.started.get_or_insert_with(Instant::now);
        if let Some(remaining) = self.budget.checked_sub(started.elapsed()) {
            if let Ok(status) = tokio::time::timeout(remaining, child.tick()).await {
                if status.is_terminal() {
                    self.started = None;
                }
                return Ok(status);
            }
        }

        // Budget exhausted, either before the tick or mid-flight.
        tracing::warn!(
            node = node_name,
            budget_secs = self.budget.as_secs_f64(),
            "child exceeded its time budget"
        );
        child.cancel();
        child.reset();
        self.started = None;
        Ok(Status::Failure)
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }

    fn reset(&mut self) {
        self.started = None;
    }
}

/// After a terminal child result, reports `Failure` without ticking the
/// child until `cooldown` has elapsed.
pub struct Cooldown {
    cooldown: Duration,
    reset_on_failure: bool,
    armed_at: Option<Instant>,
}

impl Cooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            reset_on_failure: false,
            armed_at: None,
        }
    }

    /// A failing child leaves the cooldown unarmed, allowing an immediate
    /// retry on the next tick.
    pub fn with_reset_on_failure(mut self) -> Self {
        self.reset_on_failure = true;
        self
    }

    pub fn node(self, name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(self), child)
    }
}

#[async_trait]
impl Behavior for Cooldown {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if let Some(armed_at) = self.armed_at {
            if armed_at.elapsed() < self.cooldown {
                return Ok(Status::Failure);
            }
            self.armed_at = None;
        }

        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };
        let status = child.tick().await;
        if status.is_terminal() && !(status == Status::Failure && self.reset_on_failure) {
            self.armed_at = Some(Instant::now());
        }
        Ok(status)
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }

    fn reset(&mut self) {
        self.armed_at = None;
    }
}

/// Sleeps `pre_delay` before and `post_delay` after the child tick.
pub struct Delay {
    pre_delay: Duration,
    post_delay: Duration,
}

impl Delay {
    pub fn new(pre_delay: Duration, post_delay: Duration) -> Self {
        Self {
            pre_delay,
            post_delay,
        }
    }

    pub fn node(self, name: impl Into<String>, child: Node) -> Node {
        decorate(name, Box::new(self), child)
    }
}

#[async_trait]
impl Behavior for Delay {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if !self.pre_delay.is_zero() {
            tokio::time::sleep(self.pre_delay).await;
        }
        let Some(child) = child(ctx) else {
            return Ok(Status::Failure);
        };
        let status = child.tick().await;
        if !self.post_delay.is_zero() {
            tokio::time::sleep(self.post_delay).await;
        }
        Ok(status)
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }
}

fn decorate(name: impl Into<String>, behavior: Box<dyn Behavior>, child: Node) -> Node {
    let mut node = Node::new(name, behavior);
    node.add_child(child)
        .unwrap_or_else(|err| unreachable!("fresh decorator rejected its first child: {err}"));
    node
}
