//! Condition/status tracking on a record's status.
//!
//! Conditions are unique by type and keep their position. `last_transition_time` moves only
//! when the status value of a type changes; reason/message edits are applied in place without
//! counting as a transition. Types are never pruned here.

use chrono::{DateTime, Utc};

use crate::{AppServiceStatus, Condition, ConditionStatus, Phase};

pub const READY: &str = "Ready";

pub const REASON_WORKLOAD_READY: &str = "WorkloadReady";
pub const REASON_WORKLOAD_NOT_READY: &str = "WorkloadNotReady";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// What `set_condition` did to the condition list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionChange {
    Added,
    Transitioned,
    Refreshed,
    Unchanged,
}

pub fn set_condition(
    status: &mut AppServiceStatus,
    type_: &str,
    new_status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> ConditionChange {
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) if existing.status != new_status => {
            existing.status = new_status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.last_transition_time = now;
            ConditionChange::Transitioned
        }
        Some(existing) => {
            if existing.reason == reason && existing.message == message {
                return ConditionChange::Unchanged;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            ConditionChange::Refreshed
        }
        None => {
            status.conditions.push(Condition {
                type_: type_.to_string(),
                status: new_status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            });
            ConditionChange::Added
        }
    }
}

/// Stamp the outcome of a converged pass: phase, available replicas, Ready condition.
pub fn record_rollout(status: &mut AppServiceStatus, desired: i32, available: i32, now: DateTime<Utc>) {
    status.available_replicas = available.max(0);
    status.last_reconcile_time = Some(now);
    if available == desired {
        status.phase = Phase::Ready;
        set_condition(status, READY, ConditionStatus::True, REASON_WORKLOAD_READY, "All replicas are available", now);
    } else {
        status.phase = Phase::Pending;
        let msg = format!("Waiting for replicas ({}/{} available)", available.max(0), desired);
        set_condition(status, READY, ConditionStatus::False, REASON_WORKLOAD_NOT_READY, &msg, now);
    }
}

/// Stamp a terminal validation failure.
pub fn record_invalid(status: &mut AppServiceStatus, message: &str, now: DateTime<Utc>) {
    status.phase = Phase::Failed;
    status.last_reconcile_time = Some(now);
    set_condition(status, READY, ConditionStatus::False, REASON_INVALID_SPEC, message, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn appends_unknown_types_in_order() {
        let mut st = AppServiceStatus::default();
        assert_eq!(set_condition(&mut st, "Ready", ConditionStatus::False, "R", "m", t(0)), ConditionChange::Added);
        assert_eq!(set_condition(&mut st, "Degraded", ConditionStatus::False, "R", "m", t(0)), ConditionChange::Added);
        let types: Vec<_> = st.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Ready", "Degraded"]);
    }

    #[test]
    fn transition_replaces_in_place_and_bumps_time() {
        let mut st = AppServiceStatus::default();
        set_condition(&mut st, "Ready", ConditionStatus::False, "A", "a", t(0));
        set_condition(&mut st, "Other", ConditionStatus::True, "B", "b", t(0));
        let change = set_condition(&mut st, "Ready", ConditionStatus::True, "C", "c", t(5));
        assert_eq!(change, ConditionChange::Transitioned);
        assert_eq!(st.conditions.len(), 2);
        let c = &st.conditions[0];
        assert_eq!(c.type_, "Ready");
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.reason, "C");
        assert_eq!(c.last_transition_time, t(5));
    }

    #[test]
    fn cosmetic_edit_keeps_transition_time() {
        let mut st = AppServiceStatus::default();
        set_condition(&mut st, "Ready", ConditionStatus::False, "A", "waiting 0/3", t(0));
        let change = set_condition(&mut st, "Ready", ConditionStatus::False, "A", "waiting 1/3", t(9));
        assert_eq!(change, ConditionChange::Refreshed);
        let c = st.condition("Ready").unwrap();
        assert_eq!(c.message, "waiting 1/3");
        assert_eq!(c.last_transition_time, t(0));
        assert_eq!(
            set_condition(&mut st, "Ready", ConditionStatus::False, "A", "waiting 1/3", t(10)),
            ConditionChange::Unchanged
        );
    }

    #[test]
    fn repeated_calls_never_duplicate_a_type() {
        let mut st = AppServiceStatus::default();
        let seq = [ConditionStatus::False, ConditionStatus::False, ConditionStatus::True, ConditionStatus::Unknown, ConditionStatus::Unknown];
        let mut last = None;
        for (i, s) in seq.iter().enumerate() {
            set_condition(&mut st, "Ready", *s, "R", "m", t(i as i64));
            assert_eq!(st.conditions.len(), 1);
            let ts = st.conditions[0].last_transition_time;
            if let Some((prev_status, prev_ts)) = last {
                assert_eq!(prev_status != *s, prev_ts != ts, "step {}", i);
            }
            last = Some((*s, ts));
        }
    }

    #[test]
    fn rollout_sets_phase_from_availability() {
        let mut st = AppServiceStatus::default();
        record_rollout(&mut st, 3, 0, t(0));
        assert_eq!(st.phase, Phase::Pending);
        assert_eq!(st.condition(READY).unwrap().reason, REASON_WORKLOAD_NOT_READY);
        record_rollout(&mut st, 3, 3, t(1));
        assert_eq!(st.phase, Phase::Ready);
        assert_eq!(st.available_replicas, 3);
        let c = st.condition(READY).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.last_transition_time, t(1));
        assert_eq!(st.last_reconcile_time, Some(t(1)));
    }

    #[test]
    fn invalid_marks_failed() {
        let mut st = AppServiceStatus::default();
        record_invalid(&mut st, "invalid spec: port", t(0));
        assert_eq!(st.phase, Phase::Failed);
        assert_eq!(st.condition(READY).unwrap().reason, REASON_INVALID_SPEC);
    }
}
