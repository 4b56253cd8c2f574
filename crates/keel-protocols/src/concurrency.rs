//! Concurrency key policies.

use serde::{Deserialize, Serialize};

/// What to do when a concurrency group is at its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyStrategy {
    /// Leave excess runs queued until a slot in the group frees up.
    Queue,
    /// Cancel the oldest running member of the group to admit the new run.
    CancelInProgress,
}

impl Default for ConcurrencyStrategy {
    fn default() -> Self {
        ConcurrencyStrategy::Queue
    }
}

/// Concurrency policy attached to a declaration.
///
/// `key_expr` is a dot-path evaluated against the run input, rooted at
/// `input` (e.g. `"input.customer_id"`). Runs sharing the evaluated key form
/// a group; at most `max_runs` members of a group may be running at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    /// Dot-path expression over the run input.
    pub key_expr: String,
    /// Maximum concurrently running group members.
    pub max_runs: u32,
    /// Limit strategy.
    #[serde(default)]
    pub strategy: ConcurrencyStrategy,
}

impl ConcurrencyPolicy {
    /// Create a policy.
    pub fn new(key_expr: impl Into<String>, max_runs: u32, strategy: ConcurrencyStrategy) -> Self {
        Self {
            key_expr: key_expr.into(),
            max_runs,
            strategy,
        }
    }

    /// Evaluate the key expression against a run input.
    ///
    /// Missing paths evaluate to the literal `"null"` group rather than an
    /// error: admission control must not reject work a schema already
    /// admitted.
    pub fn evaluate(&self, input: &serde_json::Value) -> String {
        let mut path = self.key_expr.split('.');
        let mut current = match path.next() {
            Some("input") => input,
            _ => return "null".to_string(),
        };
        for segment in path {
            match current.get(segment) {
                Some(v) => current = v,
                None => return "null".to_string(),
            }
        }
        match current {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// The concurrency constraint resolved onto one task run at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConcurrency {
    /// Evaluated group key.
    pub key: String,
    /// Group limit.
    pub max_runs: u32,
    /// Limit strategy.
    pub strategy: ConcurrencyStrategy,
}

impl ConcurrencyPolicy {
    /// Resolve this policy against a concrete input.
    pub fn resolve(&self, input: &serde_json::Value) -> RunConcurrency {
        RunConcurrency {
            key: self.evaluate(input),
            max_runs: self.max_runs,
            strategy: self.strategy,
        }
    }
}
