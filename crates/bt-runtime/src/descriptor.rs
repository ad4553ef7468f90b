//! Tree descriptors: the node-construction graph handed over by external
//! configuration, and the builder that turns it into a live tree.
//!
//! The descriptor schema itself belongs to the producer; this module only
//! validates what the core needs: known kinds, required well-typed
//! properties, child-count rules, and name uniqueness.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use bt_core::{rng, EventKind, Node, TreeError};
use bt_nodes::{
    Action, ActionCtx, ActionFn, ActionResult, BlackboardDelete, BlackboardSet, CompareOp,
    Condition, ConditionCtx, ConditionFn, Cooldown, DebugLog, Delay, EventEmit, ForceFailure,
    ForceSuccess, Inverter, LogLevel, MemoryPolicy, Parallel, ParallelPolicy, RandomSelector,
    ReactiveSelector, ReactiveSequence, Repeat, Retry, Selector, Sequence, Throttle,
    TimedCondition, Timeout, Wait,
};

/// One node of the construction graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_children(mut self, children: Vec<NodeSpec>) -> Self {
        self.children = children;
        self
    }

    /// Reads a descriptor file; the format follows the extension
    /// (`.json`, `.yaml`, `.yml`).
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown node type `{kind}` for node `{name}`")]
    UnknownKind { name: String, kind: String },

    #[error("node `{name}`: missing required property `{property}`")]
    MissingProperty { name: String, property: &'static str },

    #[error("node `{name}`: invalid property `{property}`: {reason}")]
    InvalidProperty {
        name: String,
        property: &'static str,
        reason: String,
    },

    #[error("duplicate node name `{0}` in tree")]
    DuplicateName(String),

    #[error("node `{name}` ({kind}) expects {expected} children, found {found}")]
    ChildCount {
        name: String,
        kind: String,
        expected: &'static str,
        found: usize,
    },

    #[error("node `{name}`: no registered {what} named `{factory}`")]
    UnknownFactory {
        name: String,
        what: &'static str,
        factory: String,
    },

    #[error("unknown subtree `{0}`")]
    UnknownSubtree(String),

    #[error("no descriptor has been loaded")]
    NoDescriptor,

    #[error("unsupported descriptor format `{0}` (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("descriptor io: {0}")]
    Io(#[from] std::io::Error),

    #[error("descriptor json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("descriptor yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Named factories resolving descriptor `action`/`condition` references to
/// real user functions.
#[derive(Default)]
pub struct LeafRegistry {
    actions: BTreeMap<String, ActionFn>,
    conditions: BTreeMap<String, ConditionFn>,
}

impl LeafRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(ActionCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ActionResult>> + Send + 'static,
    {
        self.actions
            .insert(name.into(), std::sync::Arc::new(move |ctx| Box::pin(func(ctx))));
    }

    pub fn register_condition<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&ConditionCtx<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.conditions.insert(name.into(), std::sync::Arc::new(func));
    }

    pub fn action(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).cloned()
    }

    pub fn condition(&self, name: &str) -> Option<ConditionFn> {
        self.conditions.get(name).cloned()
    }
}

/// Builds live nodes from a [`NodeSpec`], resolving leaves through the
/// registry and subtree references through the registered specs.
pub struct TreeBuilder<'a> {
    registry: &'a LeafRegistry,
    subtrees: &'a BTreeMap<String, NodeSpec>,
    seed: u64,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        registry: &'a LeafRegistry,
        subtrees: &'a BTreeMap<String, NodeSpec>,
        seed: u64,
    ) -> Self {
        Self {
            registry,
            subtrees,
            seed,
        }
    }

    pub fn build(&self, spec: &NodeSpec) -> Result<Node, ConfigError> {
        let mut seen = BTreeSet::new();
        self.build_node(spec, &mut seen)
    }

    fn build_node(
        &self,
        spec: &NodeSpec,
        seen: &mut BTreeSet<String>,
    ) -> Result<Node, ConfigError> {
        if !seen.insert(spec.name.clone()) {
            return Err(ConfigError::DuplicateName(spec.name.clone()));
        }

        let node = match spec.kind.as_str() {
            "SequenceNode" => {
                let mut sequence = Sequence::new(self.memory_policy(spec)?);
                if bool_prop(spec, "skip_errors")? {
                    sequence = sequence.with_skip_errors();
                }
                self.composite(spec, Box::new(sequence), seen)?
            }
            "SelectorNode" => {
                let selector = Selector::new(self.memory_policy(spec)?);
                self.composite(spec, Box::new(selector), seen)?
            }
            "ReactiveSequence" => self.composite(spec, Box::new(ReactiveSequence::new()), seen)?,
            "ReactiveSelector" => self.composite(spec, Box::new(ReactiveSelector::new()), seen)?,
            "RandomSelector" => {
                let mut hasher = DefaultHasher::new();
                spec.name.hash(&mut hasher);
                let seed = rng::derive_seed(self.seed, hasher.finish());
                self.composite(spec, Box::new(RandomSelector::new(seed)), seen)?
            }
            "ParallelNode" => {
                let policy = match str_prop(spec, "policy")? {
                    Some(raw) => ParallelPolicy::from_str(raw).map_err(|e| {
                        ConfigError::InvalidProperty {
                            name: spec.name.clone(),
                            property: "policy",
                            reason: e.to_string(),
                        }
                    })?,
                    None => ParallelPolicy::RequireAll,
                };
                let mut parallel = Parallel::new(policy);
                if let Some(threshold) = usize_prop(spec, "success_threshold")? {
                    parallel = parallel.with_success_threshold(threshold);
                }
                if let Some(threshold) = usize_prop(spec, "failure_threshold")? {
                    parallel = parallel.with_failure_threshold(threshold);
                }
                if bool_prop(spec, "synchronized")? {
                    parallel = parallel.with_synchronized();
                }
                self.composite(spec, Box::new(parallel), seen)?
            }
            "InverterNode" => self.decorator(spec, Box::new(Inverter), seen)?,
            "ForceSuccessNode" => self.decorator(spec, Box::new(ForceSuccess), seen)?,
            "ForceFailureNode" => self.decorator(spec, Box::new(ForceFailure), seen)?,
            "RepeatNode" => {
                let count = require_u64(spec, "count")? as u32;
                let mut repeat = Repeat::new(count);
                if bool_prop(spec, "ignore_failure")? {
                    repeat = repeat.with_ignore_failure();
                }
                self.decorator(spec, Box::new(repeat), seen)?
            }
            "RetryNode" => {
                let max_attempts = u64_prop(spec, "max_attempts")?.unwrap_or(3) as u32;
                let delay = duration_prop(spec, "delay")?.unwrap_or(Duration::ZERO);
                let mut retry = Retry::new(max_attempts, delay);
                if bool_prop(spec, "exponential_backoff")? {
                    retry = retry.with_exponential_backoff();
                }
                if let Some(jitter) = f64_prop(spec, "jitter")? {
                    let mut hasher = DefaultHasher::new();
                    spec.name.hash(&mut hasher);
                    retry = retry.with_jitter(jitter, rng::derive_seed(self.seed, hasher.finish()));
                }
                self.decorator(spec, Box::new(retry), seen)?
            }
            "TimeoutNode" => {
                let budget = require_duration(spec, "timeout")?;
                self.decorator(spec, Box::new(Timeout::new(budget)), seen)?
            }
            "CooldownNode" => {
                let cooldown = require_duration(spec, "cooldown")?;
                let mut behavior = Cooldown::new(cooldown);
                if bool_prop(spec, "reset_on_failure")? {
                    behavior = behavior.with_reset_on_failure();
                }
                self.decorator(spec, Box::new(behavior), seen)?
            }
            "DelayNode" => {
                let pre = duration_prop(spec, "pre_delay")?.unwrap_or(Duration::ZERO);
                let post = duration_prop(spec, "post_delay")?.unwrap_or(Duration::ZERO);
                self.decorator(spec, Box::new(Delay::new(pre, post)), seen)?
            }
            "ActionNode" => {
                let factory = str_prop(spec, "action")?.unwrap_or(spec.name.as_str());
                let func = self.registry.action(factory).ok_or_else(|| {
                    ConfigError::UnknownFactory {
                        name: spec.name.clone(),
                        what: "action",
                        factory: factory.to_string(),
                    }
                })?;
                let mut action = Action::from_fn(func);
                if let Some(timeout) = duration_prop(spec, "timeout")? {
                    action = action.with_timeout(timeout);
                }
                if let Some(retries) = u64_prop(spec, "retry_count")? {
                    action = action.with_retry_count(retries as u32);
                }
                if bool_prop(spec, "ignore_errors")? {
                    action = action.with_ignore_errors();
                }
                if let Some(Value::Array(args)) = spec.properties.get("args") {
                    action = action.with_args(args.clone());
                }
                self.leaf(spec, Box::new(action))?
            }
            "ConditionNode" => {
                let condition = self.condition_from(spec)?;
                self.leaf(spec, Box::new(condition))?
            }
            "TimedConditionNode" => {
                let condition = self.condition_from(spec)?;
                let window = require_duration(spec, "duration")?;
                let mut timed = TimedCondition::new(condition, window);
                if let Some(ratio) = f64_prop(spec, "required_success_ratio")? {
                    timed = timed.with_required_ratio(ratio);
                }
                self.leaf(spec, Box::new(timed))?
            }
            "WaitNode" => {
                let duration = require_duration(spec, "duration")?;
                let mut wait = Wait::new(duration);
                if let Some(variance) = f64_prop(spec, "random_variance")? {
                    let mut hasher = DefaultHasher::new();
                    spec.name.hash(&mut hasher);
                    wait =
                        wait.with_random_variance(variance, rng::derive_seed(self.seed, hasher.finish()));
                }
                self.leaf(spec, Box::new(wait))?
            }
            "ThrottleNode" => {
                let interval = require_duration(spec, "min_interval")?;
                let mut throttle = Throttle::new(interval);
                if bool_prop(spec, "sticky_success")? {
                    throttle = throttle.with_sticky_success();
                }
                if let Some(factory) = str_prop(spec, "action")? {
                    let func = self.registry.action(factory).ok_or_else(|| {
                        ConfigError::UnknownFactory {
                            name: spec.name.clone(),
                            what: "action",
                            factory: factory.to_string(),
                        }
                    })?;
                    throttle = throttle.with_action_fn(func);
                }
                self.leaf(spec, Box::new(throttle))?
            }
            "DebugLogNode" => {
                let message = str_prop(spec, "message")?.unwrap_or("").to_string();
                let level = match str_prop(spec, "level")? {
                    Some(raw) => {
                        LogLevel::from_str(raw).map_err(|e| ConfigError::InvalidProperty {
                            name: spec.name.clone(),
                            property: "level",
                            reason: e.to_string(),
                        })?
                    }
                    None => LogLevel::Info,
                };
                self.leaf(spec, Box::new(DebugLog::new(message, level)))?
            }
            "EventEmitNode" => {
                let raw = require_str(spec, "event")?;
                let kind: EventKind = serde_json::from_value(Value::String(raw.to_string()))
                    .map_err(|e| ConfigError::InvalidProperty {
                        name: spec.name.clone(),
                        property: "event",
                        reason: e.to_string(),
                    })?;
                let mut emit = EventEmit::new(kind);
                if let Some(payload) = spec.properties.get("payload") {
                    emit = emit.with_payload(payload.clone());
                }
                self.leaf(spec, Box::new(emit))?
            }
            "BlackboardSetNode" => {
                let key = require_str(spec, "key")?.to_string();
                let value = spec
                    .properties
                    .get("value")
                    .cloned()
                    .ok_or_else(|| ConfigError::MissingProperty {
                        name: spec.name.clone(),
                        property: "value",
                    })?;
                let mut behavior = BlackboardSet::new(key, value);
                if let Some(namespace) = str_prop(spec, "namespace")? {
                    behavior = behavior.in_namespace(namespace);
                }
                self.leaf(spec, Box::new(behavior))?
            }
            "BlackboardDeleteNode" => {
                let key = require_str(spec, "key")?.to_string();
                let mut behavior = BlackboardDelete::new(key);
                if let Some(namespace) = str_prop(spec, "namespace")? {
                    behavior = behavior.in_namespace(namespace);
                }
                self.leaf(spec, Box::new(behavior))?
            }
            "SubtreeRef" => {
                let target = str_prop(spec, "subtree")?.unwrap_or(spec.name.as_str());
                let template = self
                    .subtrees
                    .get(target)
                    .ok_or_else(|| ConfigError::UnknownSubtree(target.to_string()))?;
                // Each instantiation is a fresh build with its own name
                // scope; only the mount name participates in the outer
                // uniqueness check.
                let mut instance = self.build(template)?;
                instance = rename(instance, &spec.name);
                instance
            }
            _ => {
                return Err(ConfigError::UnknownKind {
                    name: spec.name.clone(),
                    kind: spec.kind.clone(),
                })
            }
        };

        Ok(node)
    }

    fn condition_from(&self, spec: &NodeSpec) -> Result<Condition, ConfigError> {
        if let Some(key) = str_prop(spec, "blackboard_key")? {
            let namespace = str_prop(spec, "namespace")?.unwrap_or(bt_core::DEFAULT_NAMESPACE);
            let operator = match str_prop(spec, "operator")? {
                Some(raw) => {
                    CompareOp::from_str(raw).map_err(|e| ConfigError::InvalidProperty {
                        name: spec.name.clone(),
                        property: "operator",
                        reason: e.to_string(),
                    })?
                }
                None => CompareOp::Eq,
            };
            let expected = spec
                .properties
                .get("expected_value")
                .cloned()
                .unwrap_or(Value::Null);
            return Ok(Condition::on_key(namespace, key, operator, expected));
        }

        let factory = str_prop(spec, "condition")?.unwrap_or(spec.name.as_str());
        let func = self
            .registry
            .condition(factory)
            .ok_or_else(|| ConfigError::UnknownFactory {
                name: spec.name.clone(),
                what: "condition",
                factory: factory.to_string(),
            })?;
        Ok(Condition::from_fn(func))
    }

    fn memory_policy(&self, spec: &NodeSpec) -> Result<MemoryPolicy, ConfigError> {
        match str_prop(spec, "memory_policy")? {
            Some(raw) => MemoryPolicy::from_str(raw).map_err(|e| ConfigError::InvalidProperty {
                name: spec.name.clone(),
                property: "memory_policy",
                reason: e.to_string(),
            }),
            None => Ok(MemoryPolicy::Fresh),
        }
    }

    fn composite(
        &self,
        spec: &NodeSpec,
        behavior: Box<dyn bt_core::Behavior>,
        seen: &mut BTreeSet<String>,
    ) -> Result<Node, ConfigError> {
        let mut node = Node::new(&spec.name, behavior).with_properties(spec.properties.clone());
        for child_spec in &spec.children {
            node.add_child(self.build_node(child_spec, seen)?)?;
        }
        Ok(node)
    }

    fn decorator(
        &self,
        spec: &NodeSpec,
        behavior: Box<dyn bt_core::Behavior>,
        seen: &mut BTreeSet<String>,
    ) -> Result<Node, ConfigError> {
        if spec.children.len() != 1 {
            return Err(ConfigError::ChildCount {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
                expected: "exactly 1",
                found: spec.children.len(),
            });
        }
        let mut node = Node::new(&spec.name, behavior).with_properties(spec.properties.clone());
        node.add_child(self.build_node(&spec.children[0], seen)?)?;
        Ok(node)
    }

    fn leaf(
        &self,
        spec: &NodeSpec,
        behavior: Box<dyn bt_core::Behavior>,
    ) -> Result<Node, ConfigError> {
        if !spec.children.is_empty() {
            return Err(ConfigError::ChildCount {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
                expected: "no",
                found: spec.children.len(),
            });
        }
        Ok(Node::new(&spec.name, behavior).with_properties(spec.properties.clone()))
    }
}

// A subtree instance keeps its template name; when the mount point name
// differs, a pass-through shell carries the mount name.
fn rename(instance: Node, mount_name: &str) -> Node {
    if instance.name() == mount_name {
        instance
    } else {
        let mut shell = Node::new(mount_name, Box::new(PassThrough));
        shell
            .add_child(instance)
            .unwrap_or_else(|err| unreachable!("fresh shell rejected its child: {err}"));
        shell
    }
}

/// Forwards the single child's status unchanged; used for subtree mounts.
struct PassThrough;

#[async_trait::async_trait]
impl bt_core::Behavior for PassThrough {
    async fn tick(&mut self, ctx: &mut bt_core::TickCtx<'_>) -> anyhow::Result<bt_core::Status> {
        match ctx.children.first_mut() {
            Some(child) => Ok(child.tick().await),
            None => Ok(bt_core::Status::Failure),
        }
    }

    fn max_children(&self) -> Option<usize> {
        Some(1)
    }
}

fn str_prop<'s>(spec: &'s NodeSpec, key: &'static str) -> Result<Option<&'s str>, ConfigError> {
    match spec.properties.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ConfigError::InvalidProperty {
            name: spec.name.clone(),
            property: key,
            reason: format!("expected a string, found {other}"),
        }),
    }
}

fn require_str<'s>(spec: &'s NodeSpec, key: &'static str) -> Result<&'s str, ConfigError> {
    str_prop(spec, key)?.ok_or_else(|| ConfigError::MissingProperty {
        name: spec.name.clone(),
        property: key,
    })
}

fn f64_prop(spec: &NodeSpec, key: &'static str) -> Result<Option<f64>, ConfigError> {
    match spec.properties.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(ConfigError::InvalidProperty {
            name: spec.name.clone(),
            property: key,
            reason: format!("expected a number, found {other}"),
        }),
    }
}

fn u64_prop(spec: &NodeSpec, key: &'static str) -> Result<Option<u64>, ConfigError> {
    match spec.properties.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) if n.as_u64().is_some() => Ok(n.as_u64()),
        Some(other) => Err(ConfigError::InvalidProperty {
            name: spec.name.clone(),
            property: key,
            reason: format!("expected a non-negative integer, found {other}"),
        }),
    }
}

fn usize_prop(spec: &NodeSpec, key: &'static str) -> Result<Option<usize>, ConfigError> {
    Ok(u64_prop(spec, key)?.map(|n| n as usize))
}

fn require_u64(spec: &NodeSpec, key: &'static str) -> Result<u64, ConfigError> {
    u64_prop(spec, key)?.ok_or_else(|| ConfigError::MissingProperty {
        name: spec.name.clone(),
        property: key,
    })
}

fn bool_prop(spec: &NodeSpec, key: &'static str) -> Result<bool, ConfigError> {
    match spec.properties.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(ConfigError::InvalidProperty {
            name: spec.name.clone(),
            property: key,
            reason: format!("expected a boolean, found {other}"),
        }),
    }
}

fn duration_prop(spec: &NodeSpec, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match f64_prop(spec, key)? {
        None => Ok(None),
        Some(secs) if secs >= 0.0 && secs.is_finite() => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(ConfigError::InvalidProperty {
            name: spec.name.clone(),
            property: key,
            reason: format!("expected non-negative seconds, found {secs}"),
        }),
    }
}

fn require_duration(spec: &NodeSpec, key: &'static str) -> Result<Duration, ConfigError> {
    duration_prop(spec, key)?.ok_or_else(|| ConfigError::MissingProperty {
        name: spec.name.clone(),
        property: key,
    })
}
