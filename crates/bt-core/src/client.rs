//! Scoped views onto a shared [`Blackboard`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::blackboard::{Blackboard, Entry, SubscriptionId, DEFAULT_NAMESPACE};
use crate::error::BlackboardError;

/// Access restrictions for a [`BlackboardClient`]. `None` means unrestricted.
#[derive(Debug, Clone, Default)]
pub struct ClientScope {
    pub namespaces: Option<BTreeSet<String>>,
    pub read_keys: Option<BTreeSet<String>>,
    pub write_keys: Option<BTreeSet<String>>,
}

impl ClientScope {
    pub fn namespaces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn read_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn write_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }
}

/// A filtered handle to the blackboard carrying the acting node's identity.
/// Every operation outside the allowed scope fails with `AccessDenied`.
#[derive(Clone)]
pub struct BlackboardClient {
    blackboard: Arc<Blackboard>,
    actor: String,
    scope: ClientScope,
}

impl BlackboardClient {
    pub fn unrestricted(blackboard: Arc<Blackboard>, actor: impl Into<String>) -> Self {
        Self {
            blackboard,
            actor: actor.into(),
            scope: ClientScope::default(),
        }
    }

    pub fn scoped(
        blackboard: Arc<Blackboard>,
        actor: impl Into<String>,
        scope: ClientScope,
    ) -> Self {
        Self {
            blackboard,
            actor: actor.into(),
            scope,
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.blackboard
    }

    pub fn set(&self, namespace: &str, key: &str, value: Value) -> Result<u64, BlackboardError> {
        self.check(namespace, key, "write", &self.scope.write_keys)?;
        self.blackboard.set(namespace, key, value, Some(&self.actor))
    }

    pub fn set_default(&self, key: &str, value: Value) -> Result<u64, BlackboardError> {
        self.set(DEFAULT_NAMESPACE, key, value)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Value, BlackboardError> {
        self.check(namespace, key, "read", &self.scope.read_keys)?;
        self.blackboard.get(namespace, key)
    }

    pub fn get_default(&self, key: &str) -> Result<Value, BlackboardError> {
        self.get(DEFAULT_NAMESPACE, key)
    }

    pub fn get_or(&self, namespace: &str, key: &str, default: Value) -> Result<Value, BlackboardError> {
        self.check(namespace, key, "read", &self.scope.read_keys)?;
        Ok(self.blackboard.get_or(namespace, key, default))
    }

    pub fn entry(&self, namespace: &str, key: &str) -> Result<Entry, BlackboardError> {
        self.check(namespace, key, "read", &self.scope.read_keys)?;
        self.blackboard.entry(namespace, key)
    }

    pub fn contains(&self, namespace: &str, key: &str) -> Result<bool, BlackboardError> {
        self.check(namespace, key, "read", &self.scope.read_keys)?;
        Ok(self.blackboard.contains(namespace, key))
    }

    /// Returns `Ok(false)` when the key was already absent.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool, BlackboardError> {
        self.check(namespace, key, "write", &self.scope.write_keys)?;
        Ok(self.blackboard.delete(namespace, key, Some(&self.actor)))
    }

    pub fn subscribe(
        &self,
        namespace: &str,
        key: &str,
        observer: impl Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, BlackboardError> {
        self.check(namespace, key, "read", &self.scope.read_keys)?;
        Ok(self.blackboard.subscribe(namespace, key, observer))
    }

    fn check(
        &self,
        namespace: &str,
        key: &str,
        op: &'static str,
        keys: &Option<BTreeSet<String>>,
    ) -> Result<(), BlackboardError> {
        let ns_ok = self
            .scope
            .namespaces
            .as_ref()
            .map_or(true, |allowed| allowed.contains(namespace));
        let key_ok = keys.as_ref().map_or(true, |allowed| allowed.contains(key));
        if ns_ok && key_ok {
            Ok(())
        } else {
            Err(BlackboardError::AccessDenied {
                actor: self.actor.clone(),
                op,
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
        }
    }
}
