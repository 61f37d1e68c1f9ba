//! Reconciliation engine: manual/bulk matching and retroactive rule
//! application. The caller's organization is an explicit parameter on every
//! entry point; nothing here reads ambient state.

use crate::matching::{self, RULE_MATCH_CONFIDENCE};
use crate::models::{MatchRule, MatchStatus, RuleAction, RuleCondition};
use crate::services::metrics::{record_match_operation, record_transactions_classified};
use crate::services::{Database, ManualMatchFields, TransactionUpdate};
use chrono::{DateTime, NaiveDate, Utc};
use platform_core::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Bulk updates run in fixed-size slices to respect backend statement
/// limits; each slice is its own unit of atomicity.
pub const MATCH_BATCH_SIZE: usize = 100;

/// The authenticated caller, with the organization re-derived server-side
/// from their profile.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

// ============================================================================
// Manual / Bulk Matching
// ============================================================================

/// Manual or bulk match request. Field aliases keep the previous client
/// vocabulary working.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualMatchRequest {
    #[serde(default, alias = "transactionId")]
    pub transaction_id: Option<Uuid>,
    #[serde(default)]
    pub bulk: bool,
    #[serde(default, alias = "transactionIds")]
    pub transaction_ids: Option<Vec<Uuid>>,
    #[serde(default, alias = "tenantId")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, alias = "leaseId")]
    pub lease_id: Option<Uuid>,
    #[serde(default, alias = "transactionType")]
    pub transaction_type: Option<String>,
    #[serde(default, alias = "buildingId")]
    pub building_id: Option<Uuid>,
    #[serde(default, alias = "createRule")]
    pub create_rule: bool,
    #[serde(default, alias = "ruleConditions")]
    pub rule_conditions: Option<Vec<RuleCondition>>,
}

/// Outcome of one batch of a bulk apply. `updated < requested` means ids
/// were dropped by the ownership filter.
#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    pub batch_index: usize,
    pub requested: usize,
    pub updated: u64,
}

#[derive(Debug)]
pub struct ManualMatchOutcome {
    pub updated: u64,
    pub batches: Vec<BatchOutcome>,
    pub rule: Option<MatchRule>,
}

/// The transaction ids a manual match request names.
fn requested_ids(request: &ManualMatchRequest) -> Vec<Uuid> {
    if request.bulk {
        request.transaction_ids.clone().unwrap_or_default()
    } else {
        request.transaction_id.into_iter().collect()
    }
}

/// Classify explicitly-identified transactions to a tenant/lease/building/
/// category, optionally deriving a reusable rule from the match.
///
/// Ids are processed in batches of [`MATCH_BATCH_SIZE`]; each batch is
/// ownership-filtered before its update, and foreign ids are dropped
/// silently rather than failing the request. A write failure aborts the
/// remaining batches; batches already written stay written.
#[tracing::instrument(skip(db, request), fields(organization_id = %caller.organization_id))]
pub async fn match_transactions(
    db: &Database,
    caller: &Caller,
    request: ManualMatchRequest,
) -> Result<ManualMatchOutcome, AppError> {
    let ids = requested_ids(&request);

    // Nothing resolvable is not a failure, it is a zero-count success.
    if ids.is_empty() {
        record_match_operation("manual_match", "empty");
        return Ok(ManualMatchOutcome {
            updated: 0,
            batches: Vec::new(),
            rule: None,
        });
    }

    let fields = ManualMatchFields {
        tenant_id: request.tenant_id,
        lease_id: request.lease_id,
        transaction_type: request.transaction_type.clone(),
        building_id: request.building_id,
    };
    let now = Utc::now();

    let mut updated_total: u64 = 0;
    let mut batches = Vec::new();

    for (batch_index, batch) in ids.chunks(MATCH_BATCH_SIZE).enumerate() {
        let owned = db
            .filter_owned_transactions(caller.organization_id, batch)
            .await
            .inspect_err(|_| record_match_operation("manual_match", "failed"))?;

        if owned.is_empty() {
            batches.push(BatchOutcome {
                batch_index,
                requested: batch.len(),
                updated: 0,
            });
            continue;
        }

        let updated = db
            .apply_manual_match(&owned, &fields, caller.user_id, now)
            .await
            .inspect_err(|e| {
                record_match_operation("manual_match", "failed");
                tracing::error!(
                    batch_index,
                    applied_before_failure = updated_total,
                    error = %e,
                    "Bulk match aborted; earlier batches remain committed"
                );
            })?;

        updated_total += updated;
        batches.push(BatchOutcome {
            batch_index,
            requested: batch.len(),
            updated,
        });
    }

    let rule = maybe_derive_rule(db, caller, &request, updated_total, now).await?;

    record_match_operation("manual_match", "success");
    record_transactions_classified("manual", updated_total);
    tracing::info!(
        updated = updated_total,
        batches = batches.len(),
        rule_created = rule.is_some(),
        "Manual match applied"
    );

    Ok(ManualMatchOutcome {
        updated: updated_total,
        batches,
        rule,
    })
}

/// Persist a rule derived from a manual match, when one was requested and
/// at least one condition was supplied. The new rule is seeded with the
/// transactions this very match classified.
async fn maybe_derive_rule(
    db: &Database,
    caller: &Caller,
    request: &ManualMatchRequest,
    updated: u64,
    now: DateTime<Utc>,
) -> Result<Option<MatchRule>, AppError> {
    if !request.create_rule {
        return Ok(None);
    }
    let conditions = match request.rule_conditions.as_deref() {
        Some(conditions) if !conditions.is_empty() => conditions,
        _ => return Ok(None),
    };

    let action = match matching::derive_action(
        request.tenant_id,
        request.lease_id,
        request.transaction_type.as_deref(),
        request.building_id,
    ) {
        Some(action) => action,
        None => {
            tracing::warn!("Rule derivation skipped: neither tenant nor category supplied");
            return Ok(None);
        }
    };

    let name = matching::derived_rule_name(conditions);
    let last_match_at = if updated > 0 { Some(now) } else { None };
    let rule = db
        .create_rule(
            caller.organization_id,
            &name,
            conditions,
            &action,
            updated as i64,
            last_match_at,
        )
        .await?;

    Ok(Some(rule))
}

// ============================================================================
// Retroactive Rule Application
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleApplyRequest {
    #[serde(default, alias = "transactionIds")]
    pub transaction_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub preview: bool,
}

/// Key fields of a matching transaction, returned in preview mode.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPreview {
    pub id: Uuid,
    pub counterpart_name: Option<String>,
    pub purpose: Option<String>,
    pub amount_cents: i64,
    pub booking_date: NaiveDate,
    pub booking_text: Option<String>,
}

#[derive(Debug)]
pub enum RuleApplyOutcome {
    Preview {
        matches: Vec<TransactionPreview>,
        total: usize,
    },
    Applied {
        applied: u64,
    },
}

/// Build the single update payload a committed rule application writes.
///
/// `ignore` overrides the default auto status; everything a rule writes
/// carries the rule confidence, below the 1.0 of a human decision.
fn commit_update(action: &RuleAction) -> TransactionUpdate {
    match action {
        RuleAction::AssignTenant {
            tenant_id,
            lease_id,
            transaction_type,
            building_id,
        } => TransactionUpdate {
            match_status: MatchStatus::Auto,
            match_confidence: RULE_MATCH_CONFIDENCE,
            matched_tenant_id: Some(*tenant_id),
            matched_lease_id: *lease_id,
            matched_building_id: *building_id,
            transaction_type: Some(
                transaction_type
                    .clone()
                    .unwrap_or_else(|| "rent".to_string()),
            ),
        },
        RuleAction::BookAs {
            transaction_type,
            building_id,
        } => TransactionUpdate {
            match_status: MatchStatus::Auto,
            match_confidence: RULE_MATCH_CONFIDENCE,
            matched_tenant_id: None,
            matched_lease_id: None,
            matched_building_id: *building_id,
            transaction_type: Some(transaction_type.clone()),
        },
        RuleAction::Ignore { building_id } => TransactionUpdate {
            match_status: MatchStatus::Ignored,
            match_confidence: RULE_MATCH_CONFIDENCE,
            matched_tenant_id: None,
            matched_lease_id: None,
            matched_building_id: *building_id,
            transaction_type: None,
        },
    }
}

/// Apply an existing rule across the organization's unmatched transactions,
/// either as a non-mutating preview or as a committing apply.
///
/// Re-applying a rule is a no-op for transactions it already classified:
/// the candidate set only ever contains unmatched rows.
#[tracing::instrument(skip(db, request), fields(organization_id = %caller.organization_id, rule_id = %rule_id))]
pub async fn apply_rule(
    db: &Database,
    caller: &Caller,
    rule_id: Uuid,
    request: RuleApplyRequest,
) -> Result<RuleApplyOutcome, AppError> {
    let rule = db
        .get_rule(caller.organization_id, rule_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Rule not found")))?;

    let candidates = db.unmatched_transactions(caller.organization_id).await?;
    let mut matching_transactions = matching::evaluate(&rule.conditions, &candidates);

    // A caller may preview, let the user deselect, then commit the rest.
    if let Some(requested) = &request.transaction_ids {
        let keep: HashSet<Uuid> = requested.iter().copied().collect();
        matching_transactions.retain(|t| keep.contains(&t.transaction_id));
    }

    if request.preview {
        let matches: Vec<TransactionPreview> = matching_transactions
            .iter()
            .map(|t| TransactionPreview {
                id: t.transaction_id,
                counterpart_name: t.counterpart_name.clone(),
                purpose: t.purpose.clone(),
                amount_cents: t.amount_cents,
                booking_date: t.booking_date,
                booking_text: t.booking_text.clone(),
            })
            .collect();
        let total = matches.len();
        record_match_operation("rule_apply", "preview");
        return Ok(RuleApplyOutcome::Preview { matches, total });
    }

    if matching_transactions.is_empty() {
        record_match_operation("rule_apply", "empty");
        return Ok(RuleApplyOutcome::Applied { applied: 0 });
    }

    let ids: Vec<Uuid> = matching_transactions
        .iter()
        .map(|t| t.transaction_id)
        .collect();
    let update = commit_update(&rule.action);
    let now = Utc::now();

    let applied = db
        .apply_rule_update(&ids, &update, caller.user_id, now)
        .await
        .inspect_err(|_| record_match_operation("rule_apply", "failed"))?;

    if applied > 0 {
        db.advance_rule_stats(rule.rule_id, applied as i64, now)
            .await?;
    }

    let method = match update.match_status {
        MatchStatus::Ignored => "ignored",
        _ => "auto",
    };
    record_match_operation("rule_apply", "success");
    record_transactions_classified(method, applied);
    tracing::info!(applied, rule_name = %rule.name, "Rule applied retroactively");

    Ok(RuleApplyOutcome::Applied { applied })
}
