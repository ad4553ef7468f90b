//! Leaf behaviors: actions, conditions, waits, and blackboard ops.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use bt_core::{
    Behavior, BlackboardClient, Event, EventKind, Node, SplitMix64, Status, TickCtx,
    DEFAULT_NAMESPACE,
};

/// What a user action function reports back.
///
/// `Cancelled` maps to `Failure` without being treated (or logged) as an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    Success,
    Failure,
    Running,
    Cancelled,
}

impl From<bool> for ActionResult {
    fn from(ok: bool) -> Self {
        if ok {
            ActionResult::Success
        } else {
            ActionResult::Failure
        }
    }
}

impl ActionResult {
    fn into_status(self) -> Status {
        match self {
            ActionResult::Success => Status::Success,
            ActionResult::Failure | ActionResult::Cancelled => Status::Failure,
            ActionResult::Running => Status::Running,
        }
    }
}

/// Handed to every action invocation.
pub struct ActionCtx {
    pub blackboard: BlackboardClient,
    pub args: Vec<Value>,
}

pub type ActionFn =
    Arc<dyn Fn(ActionCtx) -> BoxFuture<'static, anyhow::Result<ActionResult>> + Send + Sync>;

/// Per-leaf invocation counters, one layer below the node-level stats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub error_runs: u64,
    pub last_error: Option<String>,
}

/// Wraps a user function (sync or async) as a leaf.
///
/// A `timeout` bounds each invocation: on expiry the in-flight future is
/// dropped and the run counts as `Failure`. `retry_count` grants that many
/// extra in-tick attempts after a `Failure`. `ignore_errors` turns an
/// erroring function into a logged `Success`.
pub struct Action {
    func: ActionFn,
    args: Vec<Value>,
    timeout: Option<Duration>,
    retry_count: u32,
    ignore_errors: bool,
    runs: RunStats,
}

impl Action {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(ActionCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ActionResult>> + Send + 'static,
    {
        Self::from_fn(Arc::new(move |ctx| Box::pin(func(ctx))))
    }

    pub fn from_fn(func: ActionFn) -> Self {
        Self {
            func,
            args: Vec::new(),
            timeout: None,
            retry_count: 0,
            ignore_errors: false,
            runs: RunStats::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn runs(&self) -> &RunStats {
        &self.runs
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for Action {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if ctx.cancelled {
            return Ok(Status::Failure);
        }

        let mut attempt = 0u32;
        loop {
            let call = ActionCtx {
                blackboard: ctx.blackboard.clone(),
                args: self.args.clone(),
            };
            let fut = (self.func)(call);
            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::warn!(
                            node = ctx.node_name,
                            timeout_secs = limit.as_secs_f64(),
                            "action timed out"
                        );
                        Ok(ActionResult::Failure)
                    }
                },
                None => fut.await,
            };

            self.runs.total_runs += 1;
            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    self.runs.error_runs += 1;
                    self.runs.last_error = Some(err.to_string());
                    if self.ignore_errors {
                        tracing::warn!(node = ctx.node_name, error = %err, "ignored action error");
                        ActionResult::Success
                    } else {
                        return Err(err);
                    }
                }
            };

            match result {
                ActionResult::Success => {
                    self.runs.successful_runs += 1;
                    return Ok(Status::Success);
                }
                ActionResult::Running => return Ok(Status::Running),
                ActionResult::Cancelled => {
                    self.runs.failed_runs += 1;
                    return Ok(Status::Failure);
                }
                ActionResult::Failure => {
                    self.runs.failed_runs += 1;
                    if attempt < self.retry_count {
                        attempt += 1;
                        continue;
                    }
                    return Ok(Status::Failure);
                }
            }
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}

/// Failure to parse an enum-valued property (operator, policy, log level).
#[derive(Debug, Error)]
#[error("unrecognized value `{0}`")]
pub struct ParseError(pub String);

/// Comparison applied by blackboard-driven conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FromStr for CompareOp {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            other => Err(ParseError(other.to_string())),
        }
    }
}

impl CompareOp {
    /// Equality for any value shape; ordering for numbers and strings only.
    pub fn eval(self, actual: &Value, expected: &Value) -> bool {
        match self {
            CompareOp::Eq => actual == expected,
            CompareOp::Ne => actual != expected,
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let ordering = match (actual, expected) {
                    (Value::Number(a), Value::Number(b)) => a
                        .as_f64()
                        .zip(b.as_f64())
                        .and_then(|(a, b)| a.partial_cmp(&b)),
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                };
                match ordering {
                    Some(ordering) => match self {
                        CompareOp::Lt => ordering.is_lt(),
                        CompareOp::Le => ordering.is_le(),
                        CompareOp::Gt => ordering.is_gt(),
                        CompareOp::Ge => ordering.is_ge(),
                        _ => false,
                    },
                    None => false,
                }
            }
        }
    }
}

/// Handed to condition functions; conditions are expected to be fast and
/// side-effect-free.
pub struct ConditionCtx<'a> {
    pub blackboard: &'a BlackboardClient,
}

pub type ConditionFn = Arc<dyn Fn(&ConditionCtx<'_>) -> anyhow::Result<bool> + Send + Sync>;

enum ConditionSource {
    Func(ConditionFn),
    Key {
        namespace: String,
        key: String,
        operator: CompareOp,
        expected: Value,
    },
}

/// Boolean check: either a user function or a blackboard comparison.
/// A missing blackboard key evaluates to `false` rather than erroring.
pub struct Condition {
    source: ConditionSource,
}

impl Condition {
    pub fn new(func: impl Fn(&ConditionCtx<'_>) -> anyhow::Result<bool> + Send + Sync + 'static) -> Self {
        Self::from_fn(Arc::new(func))
    }

    pub fn from_fn(func: ConditionFn) -> Self {
        Self {
            source: ConditionSource::Func(func),
        }
    }

    pub fn on_key(
        namespace: impl Into<String>,
        key: impl Into<String>,
        operator: CompareOp,
        expected: Value,
    ) -> Self {
        Self {
            source: ConditionSource::Key {
                namespace: namespace.into(),
                key: key.into(),
                operator,
                expected,
            },
        }
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }

    fn evaluate(&self, ctx: &TickCtx<'_>) -> anyhow::Result<bool> {
        match &self.source {
            ConditionSource::Func(func) => func(&ConditionCtx {
                blackboard: ctx.blackboard,
            }),
            ConditionSource::Key {
                namespace,
                key,
                operator,
                expected,
            } => match ctx.blackboard.get(namespace, key) {
                Ok(actual) => Ok(operator.eval(&actual, expected)),
                Err(err) if err.is_key_not_found() => Ok(false),
                Err(err) => Err(err.into()),
            },
        }
    }
}

#[async_trait]
impl Behavior for Condition {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let holds = self.evaluate(ctx)?;
        Ok(if holds { Status::Success } else { Status::Failure })
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}

/// Samples a condition once per tick across a time window.
///
/// Without a ratio, the first satisfaction yields `Success` and window expiry
/// yields `Failure`. With `required_ratio`, sampling continues to the end of
/// the window and the hit ratio decides.
pub struct TimedCondition {
    condition: Condition,
    window: Duration,
    required_ratio: Option<f64>,
    started: Option<Instant>,
    checks: u64,
    hits: u64,
}

impl TimedCondition {
    pub fn new(condition: Condition, window: Duration) -> Self {
        Self {
            condition,
            window,
            required_ratio: None,
            started: None,
            checks: 0,
            hits: 0,
        }
    }

    pub fn with_required_ratio(mut self, ratio: f64) -> Self {
        self.required_ratio = Some(ratio.clamp(0.0, 1.0));
        self
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }

    fn clear(&mut self) {
        self.started = None;
        self.checks = 0;
        self.hits = 0;
    }
}

#[async_trait]
impl Behavior for TimedCondition {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if ctx.cancelled {
            self.clear();
            return Ok(Status::Failure);
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        let holds = self.condition.evaluate(ctx)?;
        self.checks += 1;
        if holds {
            self.hits += 1;
        }
        let expired = started.elapsed() >= self.window;

        match self.required_ratio {
            None if holds => {
                self.clear();
                Ok(Status::Success)
            }
            None if expired => {
                self.clear();
                Ok(Status::Failure)
            }
            Some(ratio) if expired => {
                let met = self.hits as f64 / self.checks as f64 >= ratio;
                self.clear();
                Ok(if met { Status::Success } else { Status::Failure })
            }
            _ => Ok(Status::Running),
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// `Running` until `duration` has elapsed since its first tick, then
/// `Success`. Restarts the clock after every terminal result.
pub struct Wait {
    duration: Duration,
    random_variance: f64,
    rng: SplitMix64,
    target: Duration,
    started: Option<Instant>,
}

impl Wait {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            random_variance: 0.0,
            rng: SplitMix64::new(0x5EED),
            target: duration,
            started: None,
        }
    }

    /// Scales each round's target by up to `variance` (0..=1) in either
    /// direction, drawn from a deterministic stream.
    pub fn with_random_variance(mut self, variance: f64, seed: u64) -> Self {
        self.random_variance = variance.clamp(0.0, 1.0);
        self.rng = SplitMix64::new(seed);
        self
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for Wait {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if ctx.cancelled {
            self.started = None;
            return Ok(Status::Failure);
        }

        let started = match self.started {
            Some(started) => started,
            None => {
                self.target = if self.random_variance > 0.0 {
                    let base = self.duration.as_secs_f64();
                    let offset =
                        (self.rng.next_f64_unit() * 2.0 - 1.0) * base * self.random_variance;
                    Duration::from_secs_f64((base + offset).max(0.0))
                } else {
                    self.duration
                };
                let now = Instant::now();
                self.started = Some(now);
                now
            }
        };
        if started.elapsed() >= self.target {
            self.started = None;
            Ok(Status::Success)
        } else {
            Ok(Status::Running)
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }

    fn reset(&mut self) {
        self.started = None;
    }

    fn cancel(&mut self) {
        self.started = None;
    }
}

/// Rate-limits a wrapped action: at most one invocation per `min_interval`.
/// Gated ticks report `Failure`, or a sticky `Success` when configured.
pub struct Throttle {
    func: Option<ActionFn>,
    min_interval: Duration,
    sticky_success: bool,
    last_fire: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            func: None,
            min_interval,
            sticky_success: false,
            last_fire: None,
        }
    }

    pub fn with_action<F, Fut>(mut self, func: F) -> Self
    where
        F: Fn(ActionCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ActionResult>> + Send + 'static,
    {
        self.func = Some(Arc::new(move |ctx| Box::pin(func(ctx))));
        self
    }

    pub fn with_action_fn(mut self, func: ActionFn) -> Self {
        self.func = Some(func);
        self
    }

    pub fn with_sticky_success(mut self) -> Self {
        self.sticky_success = true;
        self
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for Throttle {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        if let Some(last) = self.last_fire {
            if last.elapsed() < self.min_interval {
                return Ok(if self.sticky_success {
                    Status::Success
                } else {
                    Status::Failure
                });
            }
        }

        let result = match &self.func {
            Some(func) => {
                let call = ActionCtx {
                    blackboard: ctx.blackboard.clone(),
                    args: Vec::new(),
                };
                func(call).await?
            }
            None => ActionResult::Success,
        };

        if result != ActionResult::Running {
            self.last_fire = Some(Instant::now());
        }
        Ok(result.into_status())
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }

    fn reset(&mut self) {
        self.last_fire = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ParseError(other.to_string())),
        }
    }
}

/// Writes one log line at the configured level; always `Success`.
pub struct DebugLog {
    message: String,
    level: LogLevel,
}

impl DebugLog {
    pub fn new(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            message: message.into(),
            level,
        }
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for DebugLog {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        match self.level {
            LogLevel::Trace => tracing::trace!(node = ctx.node_name, "{}", self.message),
            LogLevel::Debug => tracing::debug!(node = ctx.node_name, "{}", self.message),
            LogLevel::Info => tracing::info!(node = ctx.node_name, "{}", self.message),
            LogLevel::Warn => tracing::warn!(node = ctx.node_name, "{}", self.message),
            LogLevel::Error => tracing::error!(node = ctx.node_name, "{}", self.message),
        }
        Ok(Status::Success)
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}

/// Publishes a user-chosen event on the bus; always `Success`.
pub struct EventEmit {
    kind: EventKind,
    payload: Option<Value>,
}

impl EventEmit {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for EventEmit {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        let mut event = Event::new(self.kind, ctx.node_id, ctx.node_name);
        event.payload = self.payload.clone();
        ctx.events.emit(event);
        Ok(Status::Success)
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}

/// Writes a fixed value through the scoped client. `Failure` on access
/// denial; other blackboard failures surface as node errors.
pub struct BlackboardSet {
    namespace: String,
    key: String,
    value: Value,
}

impl BlackboardSet {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            key: key.into(),
            value,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for BlackboardSet {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        match ctx
            .blackboard
            .set(&self.namespace, &self.key, self.value.clone())
        {
            Ok(_) => Ok(Status::Success),
            Err(err) if err.is_access_denied() => {
                tracing::warn!(node = ctx.node_name, error = %err, "blackboard write denied");
                Ok(Status::Failure)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}

/// Deletes a key through the scoped client. A missing key reports `Failure`.
pub struct BlackboardDelete {
    namespace: String,
    key: String,
}

impl BlackboardDelete {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            key: key.into(),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn into_node(self, name: impl Into<String>) -> Node {
        Node::new(name, Box::new(self))
    }
}

#[async_trait]
impl Behavior for BlackboardDelete {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        match ctx.blackboard.delete(&self.namespace, &self.key) {
            Ok(true) => Ok(Status::Success),
            Ok(false) => Ok(Status::Failure),
            Err(err) if err.is_access_denied() => {
                tracing::warn!(node = ctx.node_name, error = %err, "blackboard delete denied");
                Ok(Status::Failure)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}
