//! Pure matching core: condition evaluation, rule evaluation and rule
//! derivation. No I/O here; the engine module wires these against storage.

use crate::models::{
    ConditionField, ConditionOperator, MatchStatus, RuleAction, RuleCondition, Transaction,
};
use uuid::Uuid;

/// Confidence recorded for an explicit human match.
pub const MANUAL_MATCH_CONFIDENCE: f64 = 1.0;

/// Confidence recorded when a rule classifies a transaction. Rules are
/// inherently less certain than a human decision.
pub const RULE_MATCH_CONFIDENCE: f64 = 0.95;

/// Resolve the value a condition reads from a transaction, lower-cased
/// comparison happens in the caller. Returns the value and whether it came
/// from the booking_text fallback.
fn resolve_field(transaction: &Transaction, field: ConditionField) -> (&str, bool) {
    let primary = transaction.field_value(field);
    if primary.is_empty() && field.falls_back_to_booking_text() {
        (transaction.field_value(ConditionField::BookingText), true)
    } else {
        (primary, false)
    }
}

/// Decide whether a single condition holds for a transaction.
///
/// Comparison is case-insensitive. When the resolved value came from the
/// booking_text fallback, `equals` degrades to `contains`: an exact match
/// against a free-text narrative would never fire. Unrecognized operators
/// never match; they are not an error.
pub fn condition_matches(transaction: &Transaction, condition: &RuleCondition) -> bool {
    let field = ConditionField::parse(&condition.field);
    let (resolved, from_fallback) = resolve_field(transaction, field);
    let value = resolved.to_lowercase();
    let expected = condition.value.to_lowercase();

    match ConditionOperator::parse(&condition.operator) {
        ConditionOperator::Equals if from_fallback => value.contains(&expected),
        ConditionOperator::Equals => value == expected,
        ConditionOperator::Contains => value.contains(&expected),
        ConditionOperator::StartsWith => value.starts_with(&expected),
        ConditionOperator::Unknown => false,
    }
}

/// Apply a rule's conditions (logical AND) across a candidate set.
///
/// Only `unmatched` transactions are candidates: a rule never silently
/// reclassifies data somebody already confirmed. The result preserves the
/// input ordering, so callers control presentation by pre-sorting.
pub fn evaluate<'a>(
    conditions: &[RuleCondition],
    transactions: &'a [Transaction],
) -> Vec<&'a Transaction> {
    transactions
        .iter()
        .filter(|t| t.status() == MatchStatus::Unmatched)
        .filter(|t| conditions.iter().all(|c| condition_matches(t, c)))
        .collect()
}

/// Infer the action of a rule derived from a manual match.
///
/// A tenant wins over a bare category: with a tenant the action assigns the
/// tenant (carrying the lease and, when also supplied, the category); with
/// only a category the action books the type. A building id is merged into
/// the config whichever action results. Neither present means there is
/// nothing a rule could write, so no rule is derived.
pub fn derive_action(
    tenant_id: Option<Uuid>,
    lease_id: Option<Uuid>,
    transaction_type: Option<&str>,
    building_id: Option<Uuid>,
) -> Option<RuleAction> {
    if let Some(tenant_id) = tenant_id {
        Some(RuleAction::AssignTenant {
            tenant_id,
            lease_id,
            transaction_type: transaction_type.map(str::to_owned),
            building_id,
        })
    } else {
        transaction_type.map(|transaction_type| RuleAction::BookAs {
            transaction_type: transaction_type.to_owned(),
            building_id,
        })
    }
}

/// Human label for a derived rule: the condition values joined.
pub fn derived_rule_name(conditions: &[RuleCondition]) -> String {
    let name = conditions
        .iter()
        .map(|c| c.value.trim())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(" + ");
    if name.is_empty() {
        "Unnamed rule".to_string()
    } else {
        name
    }
}
