use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of ticking a node.
///
/// `Running` means the node has not yet produced a terminal result and wants
/// to be re-ticked. `Invalid` is the initial state and the state after
/// `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
    Running,
    Error,
    Invalid,
}

impl Status {
    /// Terminal statuses end the node's current round of work.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failure | Status::Error)
    }

    pub fn is_running(self) -> bool {
        self == Status::Running
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
            Status::Running => "RUNNING",
            Status::Error => "ERROR",
            Status::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminality() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Failure.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Invalid.is_terminal());
    }
}
