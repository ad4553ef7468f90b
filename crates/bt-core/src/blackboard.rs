//! Namespaced observable key-value store shared by all nodes of a tree.
//!
//! All mutations are serialized under a single lock; reads may run
//! concurrently with each other. Subscription callbacks are queued under the
//! lock and fired after it is released, so observers never re-enter the
//! critical section.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BlackboardError;

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

const ACTIVITY_LIMIT: usize = 1024;
const IMAGE_FORMAT_VERSION: u32 = 1;

/// A stored value together with its write metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub last_modified_by: Option<String>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityOp {
    Set,
    Delete,
    Clear,
}

/// One record of the bounded activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub op: ActivityOp,
    pub namespace: String,
    pub key: Option<String>,
    pub actor: Option<String>,
    pub old_version: Option<u64>,
    pub new_version: Option<u64>,
}

/// Deep copy of the store, also the persistence file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardImage {
    pub version: u32,
    pub namespaces: BTreeMap<String, BTreeMap<String, Entry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Vec<ActivityRecord>>,
}

pub type SubscriptionId = u64;

/// Observers receive `(key, new_value, old_value)`; `new_value` is `None`
/// for deletions.
pub type Observer = Arc<dyn Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync>;

struct Inner {
    namespaces: BTreeMap<String, BTreeMap<String, Entry>>,
    subscribers: BTreeMap<(String, String), Vec<(SubscriptionId, Observer)>>,
    activity: VecDeque<ActivityRecord>,
    next_subscription: SubscriptionId,
}

impl Inner {
    fn record(&mut self, record: ActivityRecord, limit: usize) {
        if self.activity.len() == limit {
            self.activity.pop_front();
        }
        self.activity.push_back(record);
    }

    fn observers_for(&self, namespace: &str, key: &str) -> Vec<Observer> {
        self.subscribers
            .get(&(namespace.to_string(), key.to_string()))
            .map(|subs| subs.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default()
    }
}

/// The shared store. Cheap to share behind an [`Arc`]; all methods take
/// `&self`.
pub struct Blackboard {
    inner: RwLock<Inner>,
    activity_limit: usize,
    implicit_namespaces: bool,
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(DEFAULT_NAMESPACE.to_string(), BTreeMap::new());
        Self {
            inner: RwLock::new(Inner {
                namespaces,
                subscribers: BTreeMap::new(),
                activity: VecDeque::new(),
                next_subscription: 0,
            }),
            activity_limit: ACTIVITY_LIMIT,
            implicit_namespaces: true,
        }
    }

    /// Require namespaces to be created explicitly before first write.
    pub fn with_explicit_namespaces(mut self) -> Self {
        self.implicit_namespaces = false;
        self
    }

    pub fn with_activity_limit(mut self, limit: usize) -> Self {
        self.activity_limit = limit.max(1);
        self
    }

    /// Idempotent; an existing namespace is left untouched.
    pub fn create_namespace(&self, name: &str) {
        let mut inner = self.write();
        if !inner.namespaces.contains_key(name) {
            inner.namespaces.insert(name.to_string(), BTreeMap::new());
            tracing::debug!(namespace = name, "created namespace");
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.read().namespaces.keys().cloned().collect()
    }

    pub fn keys(&self, namespace: &str) -> Vec<String> {
        self.read()
            .namespaces
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.read()
            .namespaces
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(key))
    }

    /// Creates or updates an entry and returns the new version. Subscribers
    /// fire after the write commits, outside the lock.
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        actor: Option<&str>,
    ) -> Result<u64, BlackboardError> {
        let (version, old_value, observers) = {
            let mut inner = self.write();
            if !self.implicit_namespaces && !inner.namespaces.contains_key(namespace) {
                return Err(BlackboardError::NamespaceNotFound(namespace.to_string()));
            }

            let now = Utc::now();
            let ns = inner.namespaces.entry(namespace.to_string()).or_default();
            let (old_value, old_version, new_version) = match ns.get_mut(key) {
                Some(entry) => {
                    let old = entry.value.clone();
                    let old_version = entry.version;
                    entry.value = value.clone();
                    entry.last_modified_at = now;
                    entry.last_modified_by = actor.map(str::to_string);
                    entry.version += 1;
                    (Some(old), Some(old_version), entry.version)
                }
                None => {
                    ns.insert(
                        key.to_string(),
                        Entry {
                            value: value.clone(),
                            created_at: now,
                            last_modified_at: now,
                            last_modified_by: actor.map(str::to_string),
                            version: 1,
                        },
                    );
                    (None, None, 1)
                }
            };

            let limit = self.activity_limit;
            inner.record(
                ActivityRecord {
                    timestamp: now,
                    op: ActivityOp::Set,
                    namespace: namespace.to_string(),
                    key: Some(key.to_string()),
                    actor: actor.map(str::to_string),
                    old_version,
                    new_version: Some(new_version),
                },
                limit,
            );

            (new_version, old_value, inner.observers_for(namespace, key))
        };

        for observer in observers {
            observer(key, Some(&value), old_value.as_ref());
        }
        Ok(version)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Value, BlackboardError> {
        let inner = self.read();
        let ns = inner
            .namespaces
            .get(namespace)
            .ok_or_else(|| BlackboardError::NamespaceNotFound(namespace.to_string()))?;
        ns.get(key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| BlackboardError::KeyNotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    /// Like [`Blackboard::get`] but falls back to `default` on a missing key
    /// or namespace.
    pub fn get_or(&self, namespace: &str, key: &str, default: Value) -> Value {
        self.get(namespace, key).unwrap_or(default)
    }

    pub fn entry(&self, namespace: &str, key: &str) -> Result<Entry, BlackboardError> {
        let inner = self.read();
        inner
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
            .ok_or_else(|| BlackboardError::KeyNotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    pub fn version(&self, namespace: &str, key: &str) -> Option<u64> {
        self.read()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|entry| entry.version)
    }

    /// Removes an entry. A missing key is a reported no-op: the call returns
    /// `false` and nothing else happens.
    pub fn delete(&self, namespace: &str, key: &str, actor: Option<&str>) -> bool {
        let (old_value, observers) = {
            let mut inner = self.write();
            let Some(removed) = inner
                .namespaces
                .get_mut(namespace)
                .and_then(|ns| ns.remove(key))
            else {
                tracing::debug!(namespace, key, "delete of missing key ignored");
                return false;
            };

            let limit = self.activity_limit;
            inner.record(
                ActivityRecord {
                    timestamp: Utc::now(),
                    op: ActivityOp::Delete,
                    namespace: namespace.to_string(),
                    key: Some(key.to_string()),
                    actor: actor.map(str::to_string),
                    old_version: Some(removed.version),
                    new_version: None,
                },
                limit,
            );

            (removed.value, inner.observers_for(namespace, key))
        };

        for observer in observers {
            observer(key, None, Some(&old_value));
        }
        true
    }

    /// Wipes one namespace, or every namespace when `None`. Namespaces
    /// themselves (and subscriptions) survive.
    pub fn clear(&self, namespace: Option<&str>) {
        let mut inner = self.write();
        match namespace {
            Some(ns) => {
                if let Some(entries) = inner.namespaces.get_mut(ns) {
                    entries.clear();
                }
            }
            None => {
                for entries in inner.namespaces.values_mut() {
                    entries.clear();
                }
            }
        }
        let limit = self.activity_limit;
        inner.record(
            ActivityRecord {
                timestamp: Utc::now(),
                op: ActivityOp::Clear,
                namespace: namespace.unwrap_or("*").to_string(),
                key: None,
                actor: None,
                old_version: None,
                new_version: None,
            },
            limit,
        );
    }

    pub fn subscribe(
        &self,
        namespace: &str,
        key: &str,
        observer: impl Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.write();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner
            .subscribers
            .entry((namespace.to_string(), key.to_string()))
            .or_default()
            .push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.write();
        let mut removed = false;
        for subs in inner.subscribers.values_mut() {
            let before = subs.len();
            subs.retain(|(sid, _)| *sid != id);
            removed |= subs.len() != before;
        }
        removed
    }

    /// Most recent activity records, newest last.
    pub fn activity(&self, limit: usize) -> Vec<ActivityRecord> {
        let inner = self.read();
        inner
            .activity
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Deep copy of all namespaces under a read-consistent view.
    pub fn export(&self) -> BlackboardImage {
        BlackboardImage {
            version: IMAGE_FORMAT_VERSION,
            namespaces: self.read().namespaces.clone(),
            activity: None,
        }
    }

    /// Replaces the store's contents with `image`; versions resume from the
    /// stored values. Subscriptions and the activity log are untouched.
    pub fn restore(&self, image: &BlackboardImage) {
        let mut inner = self.write();
        inner.namespaces = image.namespaces.clone();
        inner
            .namespaces
            .entry(DEFAULT_NAMESPACE.to_string())
            .or_default();
    }

    pub fn save(&self, path: &Path) -> Result<(), BlackboardError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &self.export())?;
        Ok(())
    }

    /// Like [`Blackboard::save`] but also persists the activity log.
    pub fn save_with_activity(&self, path: &Path) -> Result<(), BlackboardError> {
        let mut image = self.export();
        image.activity = Some(self.read().activity.iter().cloned().collect());
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &image)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<(), BlackboardError> {
        let file = File::open(path)?;
        let image: BlackboardImage = serde_json::from_reader(BufReader::new(file))?;
        self.restore(&image);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn versions_increase_per_key() {
        let bb = Blackboard::new();
        assert_eq!(bb.set(DEFAULT_NAMESPACE, "k", json!(1), None).unwrap(), 1);
        assert_eq!(bb.set(DEFAULT_NAMESPACE, "k", json!(2), None).unwrap(), 2);
        assert_eq!(bb.set(DEFAULT_NAMESPACE, "other", json!(0), None).unwrap(), 1);
        assert_eq!(bb.version(DEFAULT_NAMESPACE, "k"), Some(2));
    }

    #[test]
    fn get_missing_key_is_an_error_unless_defaulted() {
        let bb = Blackboard::new();
        assert!(matches!(
            bb.get(DEFAULT_NAMESPACE, "absent"),
            Err(BlackboardError::KeyNotFound { .. })
        ));
        assert_eq!(bb.get_or(DEFAULT_NAMESPACE, "absent", json!(42)), json!(42));
    }

    #[test]
    fn delete_missing_key_is_a_noop() {
        let bb = Blackboard::new();
        assert!(!bb.delete(DEFAULT_NAMESPACE, "absent", None));
        bb.set(DEFAULT_NAMESPACE, "k", json!(1), None).unwrap();
        assert!(bb.delete(DEFAULT_NAMESPACE, "k", None));
        assert!(!bb.contains(DEFAULT_NAMESPACE, "k"));
    }

    #[test]
    fn explicit_namespace_mode_rejects_unknown_namespaces() {
        let bb = Blackboard::new().with_explicit_namespaces();
        assert!(matches!(
            bb.set("sensors", "k", json!(1), None),
            Err(BlackboardError::NamespaceNotFound(_))
        ));
        bb.create_namespace("sensors");
        assert!(bb.set("sensors", "k", json!(1), None).is_ok());
    }

    #[test]
    fn subscribers_observe_writes_in_order() {
        let bb = Blackboard::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        bb.subscribe(DEFAULT_NAMESPACE, "k", move |key, new, old| {
            seen2.lock().unwrap().push((
                key.to_string(),
                new.cloned(),
                old.cloned(),
            ));
        });

        bb.set(DEFAULT_NAMESPACE, "k", json!(1), Some("writer")).unwrap();
        bb.set(DEFAULT_NAMESPACE, "k", json!(2), Some("writer")).unwrap();
        bb.delete(DEFAULT_NAMESPACE, "k", Some("writer"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("k".to_string(), Some(json!(1)), None),
                ("k".to_string(), Some(json!(2)), Some(json!(1))),
                ("k".to_string(), None, Some(json!(2))),
            ]
        );
    }

    #[test]
    fn activity_log_is_bounded() {
        let bb = Blackboard::new().with_activity_limit(3);
        for i in 0..10 {
            bb.set(DEFAULT_NAMESPACE, "k", json!(i), None).unwrap();
        }
        let log = bb.activity(100);
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap().new_version, Some(10));
    }

    #[test]
    fn export_restore_roundtrip_preserves_metadata() {
        let bb = Blackboard::new();
        bb.set("nav", "goal", json!({"x": 1.5}), Some("planner")).unwrap();
        bb.set("nav", "goal", json!({"x": 2.5}), Some("planner")).unwrap();

        let image = bb.export();
        bb.clear(None);
        assert!(!bb.contains("nav", "goal"));

        bb.restore(&image);
        let entry = bb.entry("nav", "goal").unwrap();
        assert_eq!(entry.value, json!({"x": 2.5}));
        assert_eq!(entry.version, 2);
        assert_eq!(entry.last_modified_by.as_deref(), Some("planner"));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bb.json");

        let bb = Blackboard::new();
        bb.set(DEFAULT_NAMESPACE, "battery", json!(85), Some("robot")).unwrap();
        bb.save(&path).unwrap();

        let restored = Blackboard::new();
        restored.load(&path).unwrap();
        assert_eq!(
            restored.get(DEFAULT_NAMESPACE, "battery").unwrap(),
            json!(85)
        );
        assert_eq!(restored.version(DEFAULT_NAMESPACE, "battery"), Some(1));
    }
}
