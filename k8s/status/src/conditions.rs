//! Condition arithmetic shared by the reconciler, the index, and the
//! translator's status assembly.

use ai_gateway_controller_k8s_api::{Condition, Time};
use chrono::Utc;

/// Builds a condition stamped with the current time and the object's
/// generation.
pub fn new_condition(
    type_: impl ToString,
    status: &str,
    reason: impl ToString,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Sets `condition` in `conditions`, keyed by `type`.
///
/// When an existing condition of the same type has the same status, reason,
/// and message, only `observedGeneration` is refreshed so that
/// `lastTransitionTime` reflects the true transition. Otherwise the condition
/// is replaced wholesale.
pub fn set_status_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    for existing in conditions.iter_mut() {
        if existing.type_ != condition.type_ {
            continue;
        }
        if existing.status == condition.status
            && existing.reason == condition.reason
            && existing.message == condition.message
        {
            existing.observed_generation = condition.observed_generation;
        } else {
            *existing = condition;
        }
        return;
    }
    conditions.push(condition);
}

/// Whether `conditions` holds a condition of `type_` with status `"True"`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "True")
}

/// Whether `conditions` holds a condition of `type_` with status `"False"`.
pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "False")
}
