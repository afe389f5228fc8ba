//! Predicate evaluation
//!
//! Pure functions over a snapshot collection. Entities that have never
//! reported are skipped by every rule; an empty collection evaluates to
//! false.

use crate::config::RuleConfig;
use crate::snapshot::TrackedEntity;

/// Evaluate `rule` over the tracked entities
pub fn evaluate<'a, I>(rule: &RuleConfig, entities: I) -> bool
where
    I: IntoIterator<Item = &'a TrackedEntity>,
{
    let mut reported = entities.into_iter().filter(|e| e.state.is_some());

    match rule {
        RuleConfig::StateMatch { target_state } => {
            reported.any(|e| e.state.as_deref() == Some(target_state.as_str()))
        }
        RuleConfig::StateNotMatch { excluded_state } => {
            reported.any(|e| e.state.as_deref() != Some(excluded_state.as_str()))
        }
        RuleConfig::NumericRange {
            lower_limit,
            upper_limit,
        } => reported
            .filter_map(TrackedEntity::numeric_value)
            .any(|value| outside_range(value, *lower_limit, *upper_limit)),
    }
}

/// Strictly below `lower` or strictly above `upper`
pub fn outside_range(value: f64, lower: Option<f64>, upper: Option<f64>) -> bool {
    lower.is_some_and(|l| value < l) || upper.is_some_and(|u| value > u)
}
