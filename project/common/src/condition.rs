use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A typed, reasoned status signal. At most one condition per type is kept in a list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "observedGeneration", default)]
    pub observed_generation: i64,
    #[serde(
        rename = "lastTransitionTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: 0,
            last_transition_time: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }
}

pub fn find_status_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_status_condition(conditions, condition_type)
        .is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or overwrite the condition of the same type in place.
///
/// New types are appended, so list order is first-seen order. The transition time only moves
/// when the status changes. Returns whether anything changed.
pub fn set_status_condition(conditions: &mut Vec<Condition>, mut new: Condition) -> bool {
    let now = Utc::now();
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        None => {
            if new.last_transition_time.is_none() {
                new.last_transition_time = Some(now);
            }
            conditions.push(new);
            true
        }
        Some(existing) => {
            let mut changed = false;
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time.or(Some(now));
                changed = true;
            }
            if existing.reason != new.reason {
                existing.reason = new.reason;
                changed = true;
            }
            if existing.message != new.message {
                existing.message = new.message;
                changed = true;
            }
            if existing.observed_generation != new.observed_generation {
                existing.observed_generation = new.observed_generation;
                changed = true;
            }
            changed
        }
    }
}

pub fn remove_status_condition(conditions: &mut Vec<Condition>, condition_type: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.condition_type != condition_type);
    before != conditions.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_first_seen_order() {
        let mut conds = Vec::new();
        set_status_condition(
            &mut conds,
            Condition::new("A", ConditionStatus::True, "R1", ""),
        );
        set_status_condition(
            &mut conds,
            Condition::new("B", ConditionStatus::False, "R2", ""),
        );
        let changed = set_status_condition(
            &mut conds,
            Condition::new("A", ConditionStatus::False, "R3", "m"),
        );

        assert!(changed);
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].condition_type, "A");
        assert_eq!(conds[0].reason, "R3");
        assert_eq!(conds[0].status, ConditionStatus::False);
        assert_eq!(conds[1].condition_type, "B");
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut conds = Vec::new();
        let t0 = Utc::now() - chrono::Duration::hours(1);
        let mut first = Condition::new("A", ConditionStatus::True, "R1", "");
        first.last_transition_time = Some(t0);
        set_status_condition(&mut conds, first);

        set_status_condition(
            &mut conds,
            Condition::new("A", ConditionStatus::True, "R2", ""),
        );
        assert_eq!(conds[0].last_transition_time, Some(t0));

        set_status_condition(
            &mut conds,
            Condition::new("A", ConditionStatus::False, "R2", ""),
        );
        assert_ne!(conds[0].last_transition_time, Some(t0));
    }

    #[test]
    fn test_unchanged_condition_reports_no_change() {
        let mut conds = Vec::new();
        let c = Condition::new("A", ConditionStatus::True, "R1", "msg").with_observed_generation(2);
        assert!(set_status_condition(&mut conds, c.clone()));
        assert!(!set_status_condition(&mut conds, c));
        assert!(is_status_condition_true(&conds, "A"));
        assert!(remove_status_condition(&mut conds, "A"));
        assert!(find_status_condition(&conds, "A").is_none());
    }
}
