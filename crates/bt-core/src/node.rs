//! Node base: identity, lifecycle, stats, and the tick contract.
//!
//! A [`Node`] owns its children and a boxed [`Behavior`] holding the
//! node-specific logic. The base runs the shared lifecycle around every tick
//! (pre/postconditions, event emission, error capture, stats) so behaviors
//! only implement their control flow. Ownership of children statically rules
//! out cycles and second parents.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::blackboard::Blackboard;
use crate::client::{BlackboardClient, ClientScope};
use crate::error::TreeError;
use crate::event::{Event, EventBus, EventKind};
use crate::status::Status;

/// Stable generated identity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-node counters and timing, preserved across `reset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub created_at: DateTime<Utc>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub total_ticks: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_count: u64,
    /// Running mean over completed (non-`Running`) ticks.
    pub average_duration_secs: f64,
    pub completed_ticks: u64,
    pub last_error: Option<String>,
}

impl NodeStats {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            last_tick_at: None,
            total_ticks: 0,
            success_count: 0,
            failure_count: 0,
            error_count: 0,
            average_duration_secs: 0.0,
            completed_ticks: 0,
            last_error: None,
        }
    }

    fn record(&mut self, status: Status, duration_secs: f64) {
        self.last_tick_at = Some(Utc::now());
        self.total_ticks += 1;
        match status {
            Status::Success => self.success_count += 1,
            Status::Failure => self.failure_count += 1,
            Status::Error => self.error_count += 1,
            Status::Running | Status::Invalid => {}
        }
        if status.is_terminal() {
            self.completed_ticks += 1;
            let n = self.completed_ticks as f64;
            self.average_duration_secs += (duration_secs - self.average_duration_secs) / n;
        }
    }
}

/// Shared dependencies handed to every node during setup.
pub struct SetupCtx {
    pub blackboard: Arc<Blackboard>,
    pub events: Arc<EventBus>,
}

/// Everything a [`Behavior`] can reach during one tick of its node.
pub struct TickCtx<'a> {
    pub children: &'a mut [Node],
    pub blackboard: &'a BlackboardClient,
    pub events: &'a Arc<EventBus>,
    pub node_id: NodeId,
    pub node_name: &'a str,
    /// True when cooperative cancellation was requested before this tick.
    pub cancelled: bool,
}

/// Node-specific logic. Composites drive `ctx.children`; leaves do real work.
#[async_trait]
pub trait Behavior: Send {
    async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status>;

    /// Hard cap on child count: leaves 0, decorators 1, composites unbounded.
    fn max_children(&self) -> Option<usize> {
        None
    }

    async fn setup(&mut self, _ctx: &SetupCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) {}

    fn reset(&mut self) {}

    fn cancel(&mut self) {}
}

pub type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

struct Wiring {
    client: BlackboardClient,
    events: Arc<EventBus>,
}

/// A node of the tree. See the module docs for the division of labor between
/// the base and the [`Behavior`].
pub struct Node {
    name: String,
    id: NodeId,
    parent: Option<NodeId>,
    status: Status,
    properties: BTreeMap<String, Value>,
    children: Vec<Node>,
    behavior: Box<dyn Behavior>,
    stats: NodeStats,
    preconditions: Vec<Predicate>,
    postconditions: Vec<Predicate>,
    scope: ClientScope,
    wiring: Option<Wiring>,
    is_setup: bool,
    cancel_requested: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, behavior: Box<dyn Behavior>) -> Self {
        Self {
            name: name.into(),
            id: NodeId::new(),
            parent: None,
            status: Status::Invalid,
            properties: BTreeMap::new(),
            children: Vec::new(),
            behavior,
            stats: NodeStats::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            scope: ClientScope::default(),
            wiring: None,
            is_setup: false,
            cancel_requested: false,
        }
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_precondition(mut self, pred: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.preconditions.push(Box::new(pred));
        self
    }

    pub fn with_postcondition(mut self, pred: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.postconditions.push(Box::new(pred));
        self
    }

    /// Restrict the blackboard client wired at setup.
    pub fn with_scope(mut self, scope: ClientScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Node] {
        &mut self.children
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    /// Appends an owned child. Rejects duplicate sibling names and children
    /// beyond the behavior's cap (a second child on a decorator, any child on
    /// a leaf).
    pub fn add_child(&mut self, mut child: Node) -> Result<(), TreeError> {
        if let Some(max) = self.behavior.max_children() {
            if self.children.len() >= max {
                return Err(TreeError::TooManyChildren {
                    parent: self.name.clone(),
                    max,
                });
            }
        }
        if self.children.iter().any(|c| c.name == child.name) {
            return Err(TreeError::DuplicateChild {
                parent: self.name.clone(),
                name: child.name,
            });
        }
        child.parent = Some(self.id);
        self.children.push(child);
        Ok(())
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Result<Self, TreeError> {
        for child in children {
            self.add_child(child)?;
        }
        Ok(self)
    }

    /// Wires the blackboard client and event bus, runs behavior setup, and
    /// recurses into children. Called once before the first tick; a failure
    /// anywhere aborts the whole tree's initialization.
    pub fn setup<'a>(&'a mut self, ctx: &'a SetupCtx) -> BoxFuture<'a, Result<(), TreeError>> {
        Box::pin(async move {
            if self.is_setup {
                return Ok(());
            }
            let client = BlackboardClient::scoped(
                Arc::clone(&ctx.blackboard),
                self.name.clone(),
                self.scope.clone(),
            );
            self.wiring = Some(Wiring {
                client,
                events: Arc::clone(&ctx.events),
            });
            self.emit(EventKind::Initialized, None);

            if let Err(source) = self.behavior.setup(ctx).await {
                self.wiring = None;
                return Err(TreeError::SetupFailed {
                    node: self.name.clone(),
                    source,
                });
            }
            self.is_setup = true;
            self.emit(EventKind::Setup, None);

            for child in &mut self.children {
                child.setup(ctx).await?;
            }
            Ok(())
        })
    }

    /// Runs one tick of this node. Total: always yields a [`Status`], never
    /// a panic or error — behavior failures become [`Status::Error`].
    pub fn tick(&mut self) -> BoxFuture<'_, Status> {
        Box::pin(async move {
            if !self.is_setup || self.wiring.is_none() {
                tracing::error!(node = %self.name, "ticked before setup");
                self.status = Status::Error;
                return Status::Error;
            }

            let old_status = self.status;
            let cancelled = self.cancel_requested;
            if !self.preconditions.iter().all(|p| p()) {
                self.status = Status::Failure;
                self.cancel_requested = false;
                if self.status != old_status {
                    self.emit(
                        EventKind::StatusChanged,
                        Some(json!({ "from": old_status, "to": self.status })),
                    );
                }
                return Status::Failure;
            }

            let started = Instant::now();
            self.emit(EventKind::Entering, None);

            let result = match self.wiring.as_ref() {
                None => Ok(Status::Error),
                Some(wiring) => {
                    let mut ctx = TickCtx {
                        children: &mut self.children,
                        blackboard: &wiring.client,
                        events: &wiring.events,
                        node_id: self.id,
                        node_name: &self.name,
                        cancelled,
                    };
                    self.behavior.tick(&mut ctx).await
                }
            };

            let mut status = match result {
                Ok(status) => status,
                Err(err) => {
                    tracing::error!(node = %self.name, error = %err, "tick failed");
                    self.stats.last_error = Some(err.to_string());
                    self.emit(
                        EventKind::Error,
                        Some(json!({ "error": err.to_string() })),
                    );
                    Status::Error
                }
            };

            if status == Status::Success && !self.postconditions.iter().all(|p| p()) {
                status = Status::Failure;
            }
            if status.is_terminal() {
                self.cancel_requested = false;
            }

            self.status = status;
            self.stats.record(status, started.elapsed().as_secs_f64());
            self.emit(EventKind::Exiting, None);
            if status != old_status {
                self.emit(
                    EventKind::StatusChanged,
                    Some(json!({ "from": old_status, "to": status })),
                );
            }
            status
        })
    }

    /// Shuts down children first, then this node. Idempotent: one `Shutdown`
    /// emission per prior setup.
    pub fn shutdown(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for child in &mut self.children {
                child.shutdown().await;
            }
            if self.is_setup {
                self.behavior.shutdown().await;
                self.emit(EventKind::Shutdown, None);
                self.is_setup = false;
            }
        })
    }

    /// Back to `Invalid`, recursively. Stats are preserved.
    pub fn reset(&mut self) {
        self.status = Status::Invalid;
        self.cancel_requested = false;
        self.behavior.reset();
        for child in &mut self.children {
            child.reset();
        }
    }

    /// Requests cooperative cancellation of this node and all descendants. A
    /// cooperating leaf returns promptly with `Failure` on its next tick.
    pub fn cancel(&mut self) {
        self.cancel_requested = true;
        self.behavior.cancel();
        for child in &mut self.children {
            child.cancel();
        }
    }

    pub fn visit(&self, f: &mut impl FnMut(&Node)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }

    pub fn find(&self, id: NodeId) -> Option<&Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_name(name))
    }

    /// Root-to-node names joined by `/`, or `None` when `id` is not in this
    /// subtree.
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        if self.id == id {
            return Some(self.name.clone());
        }
        for child in &self.children {
            if let Some(rest) = child.path_of(id) {
                return Some(format!("{}/{}", self.name, rest));
            }
        }
        None
    }

    /// Overwrites status and stats, e.g. when restoring a snapshot.
    pub fn restore_state(&mut self, status: Status, stats: NodeStats) {
        self.status = status;
        self.stats = stats;
    }

    fn emit(&self, kind: EventKind, payload: Option<Value>) {
        if let Some(wiring) = &self.wiring {
            let mut event = Event::new(kind, self.id, self.name.clone());
            event.payload = payload;
            wiring.events.emit(event);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
