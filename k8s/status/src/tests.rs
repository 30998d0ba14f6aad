use super::conditions::*;
use ai_gateway_controller_k8s_api::{Condition, Time};
use chrono::{Duration, Utc};

fn mk_condition(type_: &str, status: &str, reason: &str) -> Condition {
    new_condition(type_, status, reason, "", Some(1))
}

#[test]
fn appends_new_condition_types() {
    let mut conditions = vec![];
    set_status_condition(&mut conditions, mk_condition("Accepted", "True", "Accepted"));
    set_status_condition(
        &mut conditions,
        mk_condition("Programmed", "True", "Programmed"),
    );
    assert_eq!(conditions.len(), 2);
}

#[test]
fn semantically_equal_update_preserves_transition_time() {
    let old_time = Time(Utc::now() - Duration::hours(1));
    let mut conditions = vec![Condition {
        last_transition_time: old_time.clone(),
        observed_generation: Some(1),
        ..mk_condition("Accepted", "True", "Accepted")
    }];

    let mut refreshed = mk_condition("Accepted", "True", "Accepted");
    refreshed.observed_generation = Some(2);
    set_status_condition(&mut conditions, refreshed);

    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].last_transition_time, old_time);
    assert_eq!(conditions[0].observed_generation, Some(2));
}

#[test]
fn changed_status_replaces_condition() {
    let old_time = Time(Utc::now() - Duration::hours(1));
    let mut conditions = vec![Condition {
        last_transition_time: old_time.clone(),
        ..mk_condition("Programmed", "False", "TranslationError")
    }];

    set_status_condition(
        &mut conditions,
        mk_condition("Programmed", "True", "Programmed"),
    );

    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].status, "True");
    assert_eq!(conditions[0].reason, "Programmed");
    assert_ne!(conditions[0].last_transition_time, old_time);
}

#[test]
fn condition_lookups() {
    let conditions = vec![
        mk_condition("Accepted", "True", "Accepted"),
        mk_condition("Programmed", "False", "TranslationError"),
    ];
    assert!(is_condition_true(&conditions, "Accepted"));
    assert!(!is_condition_true(&conditions, "Programmed"));
    assert!(is_condition_false(&conditions, "Programmed"));
    assert!(!is_condition_false(&conditions, "Missing"));
}
