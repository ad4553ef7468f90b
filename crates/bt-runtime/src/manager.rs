//! The tree manager: owns root, blackboard and event bus, drives the tick
//! loop, and keeps execution stats, snapshots, and the subtree registry.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use bt_core::{Blackboard, EventBus, Node, SetupCtx, Status, TreeError};

use crate::context::ExecutionContext;
use crate::descriptor::{ConfigError, LeafRegistry, NodeSpec, TreeBuilder};
use crate::snapshot::{NodeState, Snapshot, SnapshotPolicy};

/// Tunables of a [`TreeManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Target tick frequency for [`TreeManager::run`].
    pub tick_rate_hz: f64,
    pub snapshot_policy: SnapshotPolicy,
    /// How many snapshots the in-memory history keeps.
    pub snapshot_history: usize,
    /// Bound of the execution context's tick history.
    pub context_history: usize,
    /// Upgrade the first `Error` at root to loop termination.
    pub fatal_on_error: bool,
    /// Seed for the deterministic streams of random composites.
    pub seed: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60.0,
            snapshot_policy: SnapshotPolicy::Manual,
            snapshot_history: 32,
            context_history: 256,
            fatal_on_error: false,
            seed: 0,
        }
    }
}

/// Clonable remote control for a running manager.
#[derive(Clone, Default)]
pub struct ControlHandle {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl ControlHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }
}

/// Owns one tree and everything around it. See the module docs.
pub struct TreeManager {
    config: ManagerConfig,
    blackboard: Arc<Blackboard>,
    events: Arc<EventBus>,
    registry: LeafRegistry,
    subtrees: BTreeMap<String, NodeSpec>,
    descriptor: Option<NodeSpec>,
    root: Option<Node>,
    context: ExecutionContext,
    snapshots: VecDeque<Snapshot>,
    next_snapshot_id: u64,
    last_snapshot_at: Option<Instant>,
    control: ControlHandle,
    is_setup: bool,
}

impl Default for TreeManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl TreeManager {
    pub fn new(config: ManagerConfig) -> Self {
        let context = ExecutionContext::new(config.context_history);
        Self {
            config,
            blackboard: Arc::new(Blackboard::new()),
            events: Arc::new(EventBus::new()),
            registry: LeafRegistry::new(),
            subtrees: BTreeMap::new(),
            descriptor: None,
            root: None,
            context,
            snapshots: VecDeque::new(),
            next_snapshot_id: 0,
            last_snapshot_at: None,
            control: ControlHandle::default(),
            is_setup: false,
        }
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.blackboard
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry_mut(&mut self) -> &mut LeafRegistry {
        &mut self.registry
    }

    pub fn handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn stats(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    pub fn root_mut(&mut self) -> Option<&mut Node> {
        self.root.as_mut()
    }

    /// Installs a programmatically built tree as root.
    pub async fn set_root(&mut self, root: Node) {
        if let Some(old) = self.root.as_mut() {
            old.shutdown().await;
        }
        self.root = Some(root);
        self.descriptor = None;
        self.is_setup = false;
    }

    /// Builds and installs a tree from a descriptor graph.
    pub async fn load_descriptor(&mut self, spec: NodeSpec) -> Result<(), ConfigError> {
        let builder = TreeBuilder::new(&self.registry, &self.subtrees, self.config.seed);
        let root = builder.build(&spec)?;
        if let Some(old) = self.root.as_mut() {
            old.shutdown().await;
        }
        self.root = Some(root);
        self.descriptor = Some(spec);
        self.is_setup = false;
        Ok(())
    }

    pub async fn load_from_path(&mut self, path: &Path) -> Result<(), ConfigError> {
        let spec = NodeSpec::from_path(path)?;
        self.load_descriptor(spec).await
    }

    /// Re-serializes the descriptor the current tree was loaded from.
    pub fn save_descriptor(&self, path: &Path) -> Result<(), ConfigError> {
        let spec = self.descriptor.as_ref().ok_or(ConfigError::NoDescriptor)?;
        spec.to_path(path)
    }

    /// Registers a named subtree template. Mount it with a `SubtreeRef`
    /// descriptor node or instantiate it directly.
    pub fn register_subtree(&mut self, name: impl Into<String>, spec: NodeSpec) {
        self.subtrees.insert(name.into(), spec);
    }

    /// Builds a fresh deep copy of a registered subtree.
    pub fn instantiate_subtree(&self, name: &str) -> Result<Node, ConfigError> {
        let spec = self
            .subtrees
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSubtree(name.to_string()))?;
        TreeBuilder::new(&self.registry, &self.subtrees, self.config.seed).build(spec)
    }

    /// Sets up the whole tree. On failure the partially initialized tree is
    /// torn down again before the error is returned.
    pub async fn setup(&mut self) -> Result<(), TreeError> {
        if self.is_setup {
            return Ok(());
        }
        let root = self.root.as_mut().ok_or(TreeError::NoRoot)?;
        let ctx = SetupCtx {
            blackboard: Arc::clone(&self.blackboard),
            events: Arc::clone(&self.events),
        };
        if let Err(err) = root.setup(&ctx).await {
            root.shutdown().await;
            return Err(err);
        }
        self.is_setup = true;
        Ok(())
    }

    /// Performs a single tick and updates the execution context. Sets the
    /// tree up first when needed.
    pub async fn tick_once(&mut self) -> Result<Status, TreeError> {
        self.setup().await?;
        let root = self.root.as_mut().ok_or(TreeError::NoRoot)?;

        let started = Instant::now();
        let status = root.tick().await;
        self.context.record(status, started.elapsed());
        self.apply_snapshot_policy();
        Ok(status)
    }

    /// Drives the tick loop at `tick_rate_hz` until the root settles on
    /// `Success` or `Failure`, an external [`ControlHandle::stop`] arrives,
    /// or — with `fatal_on_error` — the root reports `Error`. The tree is
    /// shut down before returning.
    pub async fn run(&mut self) -> Result<Status, TreeError> {
        self.control.clear_stop();
        self.setup().await?;

        let interval = if self.config.tick_rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / self.config.tick_rate_hz)
        } else {
            Duration::ZERO
        };
        tracing::info!(
            tick_rate_hz = self.config.tick_rate_hz,
            "starting behavior tree"
        );

        let mut last = Status::Invalid;
        loop {
            if self.control.is_stopped() {
                tracing::info!("stop requested");
                break;
            }
            if self.control.is_paused() {
                tokio::time::sleep(interval.max(Duration::from_millis(1))).await;
                continue;
            }

            let started = Instant::now();
            last = self.tick_once().await?;
            match last {
                Status::Success | Status::Failure => break,
                Status::Error if self.config.fatal_on_error => {
                    tracing::error!("root reported an error under fatal-on-error policy");
                    break;
                }
                _ => {}
            }

            let elapsed = started.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            } else if !interval.is_zero() {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    interval_secs = interval.as_secs_f64(),
                    "tick overran its interval"
                );
            }
        }

        self.shutdown().await;
        Ok(last)
    }

    pub async fn shutdown(&mut self) {
        if let Some(root) = self.root.as_mut() {
            root.shutdown().await;
        }
        self.is_setup = false;
    }

    /// Captures blackboard and per-node state into the in-memory history and
    /// returns the snapshot id.
    pub fn take_snapshot(&mut self) -> u64 {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;

        let mut nodes = BTreeMap::new();
        if let Some(root) = &self.root {
            root.visit(&mut |node| {
                nodes.insert(
                    node.id(),
                    NodeState {
                        status: node.status(),
                        stats: node.stats().clone(),
                    },
                );
            });
        }

        while self.snapshots.len() >= self.config.snapshot_history.max(1) {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(Snapshot {
            id,
            tick_no: self.context.tick_count,
            timestamp: Utc::now(),
            blackboard: self.blackboard.export(),
            nodes,
        });
        self.last_snapshot_at = Some(Instant::now());
        tracing::debug!(snapshot_id = id, "captured snapshot");
        id
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Restores blackboard entries and per-node `(status, stats)` exactly as
    /// captured; the tick counter rewinds to the capture point.
    pub fn restore_snapshot(&mut self, id: u64) -> Result<(), TreeError> {
        let snapshot = self
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(TreeError::UnknownSnapshot(id))?;

        self.blackboard.restore(&snapshot.blackboard);
        if let Some(root) = self.root.as_mut() {
            root.visit_mut(&mut |node| {
                if let Some(state) = snapshot.nodes.get(&node.id()) {
                    node.restore_state(state.status, state.stats.clone());
                }
            });
        }
        self.context.tick_count = snapshot.tick_no;
        tracing::debug!(snapshot_id = id, "restored snapshot");
        Ok(())
    }

    fn apply_snapshot_policy(&mut self) {
        match self.config.snapshot_policy {
            SnapshotPolicy::Manual => {}
            SnapshotPolicy::EveryTicks(n) => {
                if n > 0 && self.context.tick_count % n == 0 {
                    self.take_snapshot();
                }
            }
            SnapshotPolicy::EveryDuration(period) => {
                let due = self
                    .last_snapshot_at
                    .map_or(true, |at| at.elapsed() >= period);
                if due {
                    self.take_snapshot();
                }
            }
        }
    }
}
