//! Database service for matching-service.

use crate::models::{MatchRule, MatchStatus, RuleAction, RuleCondition, Transaction};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use platform_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Fields a manual match writes. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct ManualMatchFields {
    pub tenant_id: Option<Uuid>,
    pub lease_id: Option<Uuid>,
    pub transaction_type: Option<String>,
    pub building_id: Option<Uuid>,
}

/// The single update payload a committed rule application writes to every
/// matched transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpdate {
    pub match_status: MatchStatus,
    pub match_confidence: f64,
    pub matched_tenant_id: Option<Uuid>,
    pub matched_lease_id: Option<Uuid>,
    pub matched_building_id: Option<Uuid>,
    pub transaction_type: Option<String>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "matching-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Caller Resolution
    // =========================================================================

    /// Resolve the organization of an authenticated user through their
    /// profile. Client-supplied organization claims are never trusted.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn organization_for_user(&self, user_id: Uuid) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["organization_for_user"])
            .start_timer();

        let organization_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT organization_id
            FROM profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to resolve organization: {}", e))
        })?;

        timer.observe_duration();
        Ok(organization_id)
    }

    // =========================================================================
    // Ownership Guard
    // =========================================================================

    /// Filter a set of transaction ids down to those owned by the given
    /// organization, resolved through the account -> connection join chain.
    /// Ids that don't resolve are dropped silently.
    #[instrument(skip(self, transaction_ids), fields(organization_id = %organization_id, requested = transaction_ids.len()))]
    pub async fn filter_owned_transactions(
        &self,
        organization_id: Uuid,
        transaction_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, AppError> {
        if transaction_ids.is_empty() {
            return Ok(Vec::new());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["filter_owned_transactions"])
            .start_timer();

        let owned = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT t.transaction_id
            FROM bank_transactions t
            INNER JOIN bank_accounts a ON a.account_id = t.account_id
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE c.organization_id = $1 AND t.transaction_id = ANY($2)
            "#,
        )
        .bind(organization_id)
        .bind(transaction_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to verify ownership: {}", e))
        })?;

        timer.observe_duration();
        Ok(owned)
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// All of an organization's unmatched transactions, newest booking date
    /// first. This is the candidate set for retroactive rule application.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn unmatched_transactions(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatched_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT t.transaction_id, t.account_id, t.counterpart_name, t.counterpart_iban,
                   t.purpose, t.booking_text, t.amount_cents, t.booking_date, t.currency,
                   t.match_status, t.match_confidence, t.matched_at, t.matched_by,
                   t.matched_tenant_id, t.matched_lease_id, t.matched_building_id,
                   t.transaction_type, t.created_utc
            FROM bank_transactions t
            INNER JOIN bank_accounts a ON a.account_id = t.account_id
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE c.organization_id = $1 AND t.match_status = 'unmatched'
            ORDER BY t.booking_date DESC, t.transaction_id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get unmatched transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    /// Cursor-paginated unmatched listing for the review queue.
    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn list_unmatched_transactions(
        &self,
        organization_id: Uuid,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<Transaction>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unmatched_transactions"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let transactions = if let Some(cursor) = page_token {
            let cursor_uuid = Uuid::parse_str(cursor)
                .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid page_token")))?;
            sqlx::query_as::<_, Transaction>(
                r#"
                SELECT t.transaction_id, t.account_id, t.counterpart_name, t.counterpart_iban,
                       t.purpose, t.booking_text, t.amount_cents, t.booking_date, t.currency,
                       t.match_status, t.match_confidence, t.matched_at, t.matched_by,
                       t.matched_tenant_id, t.matched_lease_id, t.matched_building_id,
                       t.transaction_type, t.created_utc
                FROM bank_transactions t
                INNER JOIN bank_accounts a ON a.account_id = t.account_id
                INNER JOIN bank_connections c ON c.connection_id = a.connection_id
                WHERE c.organization_id = $1 AND t.match_status = 'unmatched' AND t.transaction_id > $2
                ORDER BY t.transaction_id
                LIMIT $3
                "#,
            )
            .bind(organization_id)
            .bind(cursor_uuid)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Transaction>(
                r#"
                SELECT t.transaction_id, t.account_id, t.counterpart_name, t.counterpart_iban,
                       t.purpose, t.booking_text, t.amount_cents, t.booking_date, t.currency,
                       t.match_status, t.match_confidence, t.matched_at, t.matched_by,
                       t.matched_tenant_id, t.matched_lease_id, t.matched_building_id,
                       t.transaction_type, t.created_utc
                FROM bank_transactions t
                INNER JOIN bank_accounts a ON a.account_id = t.account_id
                INNER JOIN bank_connections c ON c.connection_id = a.connection_id
                WHERE c.organization_id = $1 AND t.match_status = 'unmatched'
                ORDER BY t.transaction_id
                LIMIT $2
                "#,
            )
            .bind(organization_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list unmatched transactions: {}", e))
        })?;

        timer.observe_duration();

        let has_more = transactions.len() > limit as usize;
        let mut transactions = transactions;
        if has_more {
            transactions.pop();
        }
        let next_token = if has_more {
            transactions.last().map(|t| t.transaction_id.to_string())
        } else {
            None
        };

        Ok((transactions, next_token))
    }

    /// Apply a manual match to a batch of (already ownership-verified) ids.
    /// Supplied fields overwrite, absent fields are left untouched.
    #[instrument(skip(self, transaction_ids, fields), fields(count = transaction_ids.len(), matched_by = %matched_by))]
    pub async fn apply_manual_match(
        &self,
        transaction_ids: &[Uuid],
        fields: &ManualMatchFields,
        matched_by: Uuid,
        matched_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_manual_match"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bank_transactions
            SET match_status = $2,
                match_confidence = $3,
                matched_at = $4,
                matched_by = $5,
                matched_tenant_id = COALESCE($6, matched_tenant_id),
                matched_lease_id = COALESCE($7, matched_lease_id),
                matched_building_id = COALESCE($8, matched_building_id),
                transaction_type = COALESCE($9, transaction_type)
            WHERE transaction_id = ANY($1)
            "#,
        )
        .bind(transaction_ids)
        .bind(MatchStatus::Manual.as_str())
        .bind(crate::matching::MANUAL_MATCH_CONFIDENCE)
        .bind(matched_at)
        .bind(matched_by)
        .bind(fields.tenant_id)
        .bind(fields.lease_id)
        .bind(fields.building_id)
        .bind(fields.transaction_type.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to apply manual match: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    /// Apply a committed rule's update payload to the matched id set in one
    /// statement. The status guard keeps the operation idempotent: ids that
    /// left the unmatched state since evaluation are skipped, not rewritten.
    #[instrument(skip(self, transaction_ids, update), fields(count = transaction_ids.len(), matched_by = %matched_by))]
    pub async fn apply_rule_update(
        &self,
        transaction_ids: &[Uuid],
        update: &TransactionUpdate,
        matched_by: Uuid,
        matched_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_rule_update"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bank_transactions
            SET match_status = $2,
                match_confidence = $3,
                matched_at = $4,
                matched_by = $5,
                matched_tenant_id = $6,
                matched_lease_id = $7,
                matched_building_id = $8,
                transaction_type = COALESCE($9, transaction_type)
            WHERE transaction_id = ANY($1) AND match_status = 'unmatched'
            "#,
        )
        .bind(transaction_ids)
        .bind(update.match_status.as_str())
        .bind(update.match_confidence)
        .bind(matched_at)
        .bind(matched_by)
        .bind(update.matched_tenant_id)
        .bind(update.matched_lease_id)
        .bind(update.matched_building_id)
        .bind(update.transaction_type.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to apply rule update: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    /// Revert a classified transaction to unmatched, clearing provenance and
    /// assignment. Scoped to the owning organization.
    #[instrument(skip(self), fields(organization_id = %organization_id, transaction_id = %transaction_id))]
    pub async fn unmatch_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unmatch_transaction"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bank_transactions t
            SET match_status = 'unmatched',
                match_confidence = NULL,
                matched_at = NULL,
                matched_by = NULL,
                matched_tenant_id = NULL,
                matched_lease_id = NULL,
                matched_building_id = NULL,
                transaction_type = NULL
            FROM bank_accounts a
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE t.transaction_id = $2
              AND a.account_id = t.account_id
              AND c.organization_id = $1
            "#,
        )
        .bind(organization_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to unmatch transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    /// Park a transaction as ignored: a terminal non-match decision with
    /// provenance but no tenant assignment. Scoped to the owning
    /// organization.
    #[instrument(skip(self), fields(organization_id = %organization_id, transaction_id = %transaction_id))]
    pub async fn ignore_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
        matched_by: Uuid,
        matched_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ignore_transaction"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bank_transactions t
            SET match_status = 'ignored',
                match_confidence = $3,
                matched_at = $4,
                matched_by = $5,
                matched_tenant_id = NULL,
                matched_lease_id = NULL,
                matched_building_id = NULL,
                transaction_type = NULL
            FROM bank_accounts a
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE t.transaction_id = $2
              AND a.account_id = t.account_id
              AND c.organization_id = $1
            "#,
        )
        .bind(organization_id)
        .bind(transaction_id)
        .bind(crate::matching::MANUAL_MATCH_CONFIDENCE)
        .bind(matched_at)
        .bind(matched_by)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to ignore transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Rule Operations
    // =========================================================================

    #[instrument(skip(self, conditions, action), fields(organization_id = %organization_id))]
    pub async fn create_rule(
        &self,
        organization_id: Uuid,
        name: &str,
        conditions: &[RuleCondition],
        action: &RuleAction,
        match_count: i64,
        last_match_at: Option<DateTime<Utc>>,
    ) -> Result<MatchRule, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_rule"])
            .start_timer();

        let rule_id = Uuid::new_v4();

        let rule = sqlx::query_as::<_, MatchRule>(
            r#"
            INSERT INTO match_rules (rule_id, organization_id, name, conditions, action, match_count, last_match_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING rule_id, organization_id, name, conditions, action, match_count, last_match_at, created_utc
            "#,
        )
        .bind(rule_id)
        .bind(organization_id)
        .bind(name)
        .bind(Json(conditions.to_vec()))
        .bind(Json(action.clone()))
        .bind(match_count)
        .bind(last_match_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create rule: {}", e)))?;

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, "Match rule created");

        Ok(rule)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id, rule_id = %rule_id))]
    pub async fn get_rule(
        &self,
        organization_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<MatchRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_rule"])
            .start_timer();

        let rule = sqlx::query_as::<_, MatchRule>(
            r#"
            SELECT rule_id, organization_id, name, conditions, action, match_count, last_match_at, created_utc
            FROM match_rules
            WHERE organization_id = $1 AND rule_id = $2
            "#,
        )
        .bind(organization_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get rule: {}", e)))?;

        timer.observe_duration();
        Ok(rule)
    }

    #[instrument(skip(self), fields(organization_id = %organization_id))]
    pub async fn list_rules(
        &self,
        organization_id: Uuid,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<MatchRule>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rules"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let rules = if let Some(cursor) = page_token {
            let cursor_uuid = Uuid::parse_str(cursor)
                .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid page_token")))?;
            sqlx::query_as::<_, MatchRule>(
                r#"
                SELECT rule_id, organization_id, name, conditions, action, match_count, last_match_at, created_utc
                FROM match_rules
                WHERE organization_id = $1 AND rule_id > $2
                ORDER BY rule_id
                LIMIT $3
                "#,
            )
            .bind(organization_id)
            .bind(cursor_uuid)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, MatchRule>(
                r#"
                SELECT rule_id, organization_id, name, conditions, action, match_count, last_match_at, created_utc
                FROM match_rules
                WHERE organization_id = $1
                ORDER BY rule_id
                LIMIT $2
                "#,
            )
            .bind(organization_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list rules: {}", e)))?;

        timer.observe_duration();

        let has_more = rules.len() > limit as usize;
        let mut rules = rules;
        if has_more {
            rules.pop();
        }
        let next_token = if has_more {
            rules.last().map(|r| r.rule_id.to_string())
        } else {
            None
        };

        Ok((rules, next_token))
    }

    /// Advance a rule's usage statistics after a committed application.
    #[instrument(skip(self), fields(rule_id = %rule_id, applied = applied))]
    pub async fn advance_rule_stats(
        &self,
        rule_id: Uuid,
        applied: i64,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["advance_rule_stats"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE match_rules
            SET match_count = match_count + $2, last_match_at = $3
            WHERE rule_id = $1
            "#,
        )
        .bind(rule_id)
        .bind(applied)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to advance rule stats: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}
