//! Condition types shared by every corral status
//!
//! All status kinds (cluster, component, volume, package) keep an ordered
//! list of conditions with at most one entry per type. `HasConditions`
//! provides the bookkeeping once for all of them.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, ClusterConfigCompleted)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition was probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,

    /// Last time the condition transitioned from one status to another
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_heartbeat_time: Some(now),
            last_transition_time: now,
        }
    }

    /// Whether status, reason and message all match `other`
    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Condition bookkeeping for a status object
///
/// Implementors only expose their condition list; lookups and transitions
/// are shared. Lists are small, so every operation is a linear scan.
pub trait HasConditions {
    /// The ordered condition list
    fn conditions(&self) -> &[Condition];

    /// Mutable access to the ordered condition list
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Find the condition of the given type and its position
    fn get_condition(&self, type_: &str) -> (Option<usize>, Option<&Condition>) {
        match self.conditions().iter().position(|c| c.type_ == type_) {
            Some(idx) => (Some(idx), self.conditions().get(idx)),
            None => (None, None),
        }
    }

    /// Whether the condition of the given type is present and True
    fn is_condition_true(&self, type_: &str) -> bool {
        matches!(
            self.get_condition(type_).1,
            Some(c) if c.status == ConditionStatus::True
        )
    }

    /// Record a condition, keeping timestamps when nothing changed
    fn set_condition(&mut self, condition: Condition) {
        let (idx, existing) = self.get_condition(&condition.type_);
        if let Some(existing) = existing {
            if existing.same_state(&condition) {
                return;
            }
        }
        match idx {
            Some(idx) => self.conditions_mut()[idx] = condition,
            None => self.conditions_mut().push(condition),
        }
    }

    /// Record a condition observed now; see [`HasConditions::update_condition_at`]
    fn update_condition(&mut self, condition: Condition) -> bool {
        self.update_condition_at(condition, Utc::now())
    }

    /// Record a condition observed at `now`, returning whether anything changed
    ///
    /// The transition time only moves when the status flips.
    fn update_condition_at(&mut self, mut condition: Condition, now: DateTime<Utc>) -> bool {
        condition.last_transition_time = now;
        let (idx, existing) = match self.get_condition(&condition.type_) {
            (Some(idx), Some(existing)) => (idx, existing.clone()),
            _ => {
                self.conditions_mut().push(condition);
                return true;
            }
        };

        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        let changed = !existing.same_state(&condition)
            || existing.last_transition_time != condition.last_transition_time;
        self.conditions_mut()[idx] = condition;
        changed
    }

    /// Remove the condition of the given type if present
    fn delete_condition(&mut self, type_: &str) {
        if let (Some(idx), _) = self.get_condition(type_) {
            self.conditions_mut().remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Default)]
    struct Ledger {
        conditions: Vec<Condition>,
    }

    impl HasConditions for Ledger {
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
    }

    fn ready(status: ConditionStatus, reason: &str) -> Condition {
        Condition::new("Ready", status, reason, "")
    }

    /// Story: a readiness probe that keeps reporting the same state does not
    /// move the transition time dashboards alert on
    #[test]
    fn story_unchanged_status_preserves_transition_time() {
        let mut ledger = Ledger::default();
        let t0 = Utc::now() - Duration::minutes(10);

        let mut first = ready(ConditionStatus::True, "Ready");
        first.last_transition_time = t0;
        ledger.set_condition(first);

        let changed =
            ledger.update_condition_at(ready(ConditionStatus::True, "Ready"), Utc::now());
        assert!(!changed);
        let (_, cond) = ledger.get_condition("Ready");
        assert_eq!(cond.map(|c| c.last_transition_time), Some(t0));
    }

    /// Story: a genuine flip advances the transition time and reports a change
    #[test]
    fn story_status_flip_advances_transition_time() {
        let mut ledger = Ledger::default();
        let t0 = Utc::now() - Duration::minutes(10);
        let mut first = ready(ConditionStatus::True, "Ready");
        first.last_transition_time = t0;
        ledger.set_condition(first);

        let t1 = Utc::now();
        let changed =
            ledger.update_condition_at(ready(ConditionStatus::False, "NotReady"), t1);
        assert!(changed);
        let (idx, cond) = ledger.get_condition("Ready");
        assert_eq!(idx, Some(0));
        assert_eq!(cond.map(|c| c.last_transition_time), Some(t1));
        assert_eq!(ledger.conditions.len(), 1);
    }

    #[test]
    fn test_update_appends_when_absent() {
        let mut ledger = Ledger::default();
        assert!(ledger.update_condition(ready(ConditionStatus::False, "Waiting")));
        assert!(ledger.update_condition(Condition::new(
            "PackageReady",
            ConditionStatus::True,
            "PackageReady",
            ""
        )));
        assert_eq!(ledger.conditions.len(), 2);
        assert_eq!(ledger.conditions[1].type_, "PackageReady");
    }

    #[test]
    fn test_update_reports_reason_change_without_moving_transition() {
        let mut ledger = Ledger::default();
        let t0 = Utc::now() - Duration::minutes(1);
        ledger.update_condition_at(ready(ConditionStatus::False, "PrerequisitesFailed"), t0);

        let changed = ledger.update_condition_at(
            ready(ConditionStatus::False, "NotReady"),
            Utc::now(),
        );
        assert!(changed);
        assert_eq!(ledger.conditions[0].reason, "NotReady");
        assert_eq!(ledger.conditions[0].last_transition_time, t0);
    }

    #[test]
    fn test_set_is_noop_for_identical_state() {
        let mut ledger = Ledger::default();
        let t0 = Utc::now() - Duration::hours(1);
        let mut first = ready(ConditionStatus::True, "Ready");
        first.last_transition_time = t0;
        first.last_heartbeat_time = Some(t0);
        ledger.set_condition(first.clone());

        ledger.set_condition(ready(ConditionStatus::True, "Ready"));
        assert_eq!(ledger.conditions, vec![first]);

        ledger.set_condition(ready(ConditionStatus::False, "Down"));
        assert_eq!(ledger.conditions.len(), 1);
        assert_eq!(ledger.conditions[0].reason, "Down");
    }

    #[test]
    fn test_delete_condition() {
        let mut ledger = Ledger::default();
        ledger.set_condition(ready(ConditionStatus::True, "Ready"));
        ledger.delete_condition("Missing");
        assert_eq!(ledger.conditions.len(), 1);
        ledger.delete_condition("Ready");
        assert!(ledger.conditions.is_empty());
        assert!(!ledger.is_condition_true("Ready"));
    }

    #[test]
    fn test_condition_serializes_kubernetes_field_names() {
        let cond = ready(ConditionStatus::True, "Ready");
        let json = serde_json::to_value(&cond).expect("serialization should succeed");
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
        assert!(json.get("lastHeartbeatTime").is_some());
    }
}
