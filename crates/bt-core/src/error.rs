use thiserror::Error;

/// Failures raised by blackboard operations.
#[derive(Debug, Error)]
pub enum BlackboardError {
    #[error("key `{key}` not found in namespace `{namespace}`")]
    KeyNotFound { namespace: String, key: String },

    #[error("namespace `{0}` does not exist")]
    NamespaceNotFound(String),

    #[error("actor `{actor}` denied {op} access to `{namespace}/{key}`")]
    AccessDenied {
        actor: String,
        op: &'static str,
        namespace: String,
        key: String,
    },

    #[error("blackboard io: {0}")]
    Io(#[from] std::io::Error),

    #[error("blackboard serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl BlackboardError {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, BlackboardError::AccessDenied { .. })
    }

    pub fn is_key_not_found(&self) -> bool {
        matches!(self, BlackboardError::KeyNotFound { .. })
    }
}

/// Failures raised while assembling or driving a tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("setup failed for node `{node}`: {source}")]
    SetupFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("node `{parent}` already has a child named `{name}`")]
    DuplicateChild { parent: String, name: String },

    #[error("node `{parent}` accepts at most {max} children")]
    TooManyChildren { parent: String, max: usize },

    #[error("tree has no root node")]
    NoRoot,

    #[error("unknown snapshot id {0}")]
    UnknownSnapshot(u64),

    #[error("unknown subtree `{0}`")]
    UnknownSubtree(String),
}
