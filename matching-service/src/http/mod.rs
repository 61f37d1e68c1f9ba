//! HTTP surface for matching-service.

pub mod auth;

use crate::engine::{
    self, ManualMatchRequest, RuleApplyOutcome, RuleApplyRequest, TransactionPreview,
};
use crate::matching;
use crate::models::{MatchRule, RuleAction, RuleCondition, Transaction};
use crate::startup::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use platform_core::error::AppError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/transactions/match", post(manual_match))
        .route("/v1/transactions/unmatched", get(list_unmatched))
        .route(
            "/v1/transactions/:transaction_id/unmatch",
            post(unmatch_transaction),
        )
        .route(
            "/v1/transactions/:transaction_id/ignore",
            post(ignore_transaction),
        )
        .route("/v1/rules", post(create_rule).get(list_rules))
        .route("/v1/rules/:rule_id", get(get_rule))
        .route("/v1/rules/:rule_id/apply", post(apply_rule))
        .with_state(state)
}

// ============================================================================
// Response Bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RuleBody {
    pub id: Uuid,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
    pub match_count: i64,
    pub last_match_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl From<MatchRule> for RuleBody {
    fn from(rule: MatchRule) -> Self {
        Self {
            id: rule.rule_id,
            name: rule.name,
            conditions: rule.conditions.0,
            action: rule.action.0,
            match_count: rule.match_count,
            last_match_at: rule.last_match_at,
            created_utc: rule.created_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionBody {
    pub id: Uuid,
    pub account_id: Uuid,
    pub counterpart_name: Option<String>,
    pub counterpart_iban: Option<String>,
    pub purpose: Option<String>,
    pub booking_text: Option<String>,
    pub amount_cents: i64,
    pub booking_date: NaiveDate,
    pub currency: String,
    pub match_status: String,
    pub match_confidence: Option<f64>,
    pub matched_at: Option<DateTime<Utc>>,
    pub matched_tenant_id: Option<Uuid>,
    pub matched_lease_id: Option<Uuid>,
    pub matched_building_id: Option<Uuid>,
    pub transaction_type: Option<String>,
}

impl From<Transaction> for TransactionBody {
    fn from(t: Transaction) -> Self {
        Self {
            id: t.transaction_id,
            account_id: t.account_id,
            counterpart_name: t.counterpart_name,
            counterpart_iban: t.counterpart_iban,
            purpose: t.purpose,
            booking_text: t.booking_text,
            amount_cents: t.amount_cents,
            booking_date: t.booking_date,
            currency: t.currency,
            match_status: t.match_status,
            match_confidence: t.match_confidence,
            matched_at: t.matched_at,
            matched_tenant_id: t.matched_tenant_id,
            matched_lease_id: t.matched_lease_id,
            matched_building_id: t.matched_building_id,
            transaction_type: t.transaction_type,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ManualMatchResponse {
    pub success: bool,
    pub updated: u64,
    pub rule: Option<RuleBody>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RuleApplyResponse {
    Preview {
        success: bool,
        matches: Vec<TransactionPreview>,
        total: usize,
    },
    Applied {
        success: bool,
        applied: u64,
    },
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<String>,
}

fn default_page_size() -> i32 {
    50
}

// ============================================================================
// Transaction Handlers
// ============================================================================

async fn manual_match(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ManualMatchRequest>,
) -> Result<Json<ManualMatchResponse>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let outcome = engine::match_transactions(&state.db, &caller, request).await?;

    Ok(Json(ManualMatchResponse {
        success: true,
        updated: outcome.updated,
        rule: outcome.rule.map(RuleBody::from),
    }))
}

async fn list_unmatched(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let (transactions, next_token) = state
        .db
        .list_unmatched_transactions(
            caller.organization_id,
            page.page_size,
            page.page_token.as_deref(),
        )
        .await?;

    let transactions: Vec<TransactionBody> =
        transactions.into_iter().map(TransactionBody::from).collect();
    Ok(Json(serde_json::json!({
        "success": true,
        "transactions": transactions,
        "next_page_token": next_token,
    })))
}

async fn unmatch_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let reverted = state
        .db
        .unmatch_transaction(caller.organization_id, transaction_id)
        .await?;
    if !reverted {
        return Err(AppError::NotFound(anyhow::anyhow!("Transaction not found")));
    }

    Ok(Json(StatusResponse { success: true }))
}

async fn ignore_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let parked = state
        .db
        .ignore_transaction(
            caller.organization_id,
            transaction_id,
            caller.user_id,
            Utc::now(),
        )
        .await?;
    if !parked {
        return Err(AppError::NotFound(anyhow::anyhow!("Transaction not found")));
    }

    Ok(Json(StatusResponse { success: true }))
}

// ============================================================================
// Rule Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: Option<String>,
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
}

async fn create_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRuleRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;

    if request.conditions.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "A rule needs at least one condition"
        )));
    }
    if request.conditions.iter().any(|c| c.value.trim().is_empty()) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Condition values must not be empty"
        )));
    }

    let name = match request.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => matching::derived_rule_name(&request.conditions),
    };

    let rule = state
        .db
        .create_rule(
            caller.organization_id,
            &name,
            &request.conditions,
            &request.action,
            0,
            None,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "rule": RuleBody::from(rule),
    })))
}

async fn get_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(rule_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let rule = state
        .db
        .get_rule(caller.organization_id, rule_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Rule not found")))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "rule": RuleBody::from(rule),
    })))
}

async fn list_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let (rules, next_token) = state
        .db
        .list_rules(
            caller.organization_id,
            page.page_size,
            page.page_token.as_deref(),
        )
        .await?;

    let rules: Vec<RuleBody> = rules.into_iter().map(RuleBody::from).collect();
    Ok(Json(serde_json::json!({
        "success": true,
        "rules": rules,
        "next_page_token": next_token,
    })))
}

async fn apply_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(rule_id): Path<Uuid>,
    Json(request): Json<RuleApplyRequest>,
) -> Result<Json<RuleApplyResponse>, AppError> {
    let caller = auth::authenticate(&state.db, &headers).await?;
    let outcome = engine::apply_rule(&state.db, &caller, rule_id, request).await?;

    let response = match outcome {
        RuleApplyOutcome::Preview { matches, total } => RuleApplyResponse::Preview {
            success: true,
            matches,
            total,
        },
        RuleApplyOutcome::Applied { applied } => RuleApplyResponse::Applied {
            success: true,
            applied,
        },
    };
    Ok(Json(response))
}
