//! Suspend conditions for `wait_for`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A suspend predicate usable in `wait_for`.
///
/// Conditions combine with logical OR; the combined wait resolves to the
/// first satisfied branch and the losing branches' subscriptions are
/// cancelled. A branch that times out resolves *successfully* with a
/// timed-out outcome: the absence of the event within budget is itself a
/// checkpointed fact, not an exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Condition {
    /// Resolve after a duration elapses.
    Sleep {
        /// How long to sleep.
        duration: Duration,
    },
    /// Resolve when a user event with this name is published, or when the
    /// timeout passes without one.
    UserEvent {
        /// Event name.
        name: String,
        /// Optional wait budget.
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<Duration>,
    },
    /// Resolve when the parent run reaches a terminal status, or when the
    /// timeout passes first.
    ParentCompletion {
        /// Optional wait budget.
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<Duration>,
    },
    /// Logical OR over branches; first satisfied branch wins.
    #[serde(untagged)]
    Or(Vec<Condition>),
}

impl Condition {
    /// Sleep condition.
    pub fn sleep(duration: Duration) -> Self {
        Condition::Sleep { duration }
    }

    /// User event condition without a timeout.
    pub fn user_event(name: impl Into<String>) -> Self {
        Condition::UserEvent {
            name: name.into(),
            timeout: None,
        }
    }

    /// User event condition with a timeout.
    pub fn user_event_within(name: impl Into<String>, timeout: Duration) -> Self {
        Condition::UserEvent {
            name: name.into(),
            timeout: Some(timeout),
        }
    }

    /// Parent completion condition.
    pub fn parent_completion(timeout: Option<Duration>) -> Self {
        Condition::ParentCompletion { timeout }
    }

    /// Combine with another condition under logical OR, flattening nested ORs.
    pub fn or(self, other: Condition) -> Self {
        let mut branches = match self {
            Condition::Or(b) => b,
            leaf => vec![leaf],
        };
        match other {
            Condition::Or(b) => branches.extend(b),
            leaf => branches.push(leaf),
        }
        Condition::Or(branches)
    }

    /// The flat list of leaf branches.
    pub fn branches(&self) -> Vec<&Condition> {
        match self {
            Condition::Or(b) => b.iter().flat_map(|c| c.branches()).collect(),
            leaf => vec![leaf],
        }
    }
}

/// The resolved outcome of a `wait_for`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionOutcome {
    /// Which branch fired: `"sleep"`, `"event:<name>"`, or `"parent"`.
    pub branch: String,
    /// Event payload or parent result, when the branch carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Whether the branch resolved by exceeding its timeout budget.
    #[serde(default)]
    pub timed_out: bool,
}

impl ConditionOutcome {
    /// A sleep branch that fired.
    pub fn slept() -> Self {
        Self {
            branch: "sleep".to_string(),
            payload: None,
            timed_out: false,
        }
    }

    /// An event branch that fired with a payload.
    pub fn event(name: &str, payload: serde_json::Value) -> Self {
        Self {
            branch: format!("event:{name}"),
            payload: Some(payload),
            timed_out: false,
        }
    }

    /// A branch that resolved by timing out.
    pub fn timed_out(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            payload: None,
            timed_out: true,
        }
    }

    /// A parent-completion branch.
    pub fn parent(payload: Option<serde_json::Value>) -> Self {
        Self {
            branch: "parent".to_string(),
            payload,
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_flattens() {
        let cond = Condition::sleep(Duration::from_secs(1))
            .or(Condition::user_event("x"))
            .or(Condition::parent_completion(None));

        match &cond {
            Condition::Or(branches) => assert_eq!(branches.len(), 3),
            other => panic!("expected Or, got {other:?}"),
        }
        assert_eq!(cond.branches().len(), 3);
    }

    #[test]
    fn test_leaf_branches() {
        let cond = Condition::user_event("x");
        assert_eq!(cond.branches().len(), 1);
    }

    #[test]
    fn test_outcome_serde() {
        let outcome = ConditionOutcome::event("x", serde_json::json!({"k": 1}));
        let json = serde_json::to_value(&outcome).unwrap();
        let back: ConditionOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
        assert_eq!(back.branch, "event:x");
        assert!(!back.timed_out);
    }
}
