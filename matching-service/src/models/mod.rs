//! Domain models for matching-service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ============================================================================
// Transaction Models
// ============================================================================

/// Lifecycle state of a bank transaction's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Unmatched,
    Manual,
    Auto,
    Ignored,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "auto" => Self::Auto,
            "ignored" => Self::Ignored,
            _ => Self::Unmatched,
        }
    }
}

/// One bank-ledger line. Created by the external ingestion pipeline in state
/// `unmatched`; only the reconciliation engine mutates the classification
/// columns, and nothing here ever deletes a row.
#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    pub transaction_id: Uuid,
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
    pub matched_by: Option<Uuid>,
    pub matched_tenant_id: Option<Uuid>,
    pub matched_lease_id: Option<Uuid>,
    pub matched_building_id: Option<Uuid>,
    pub transaction_type: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Transaction {
    pub fn status(&self) -> MatchStatus {
        MatchStatus::parse(&self.match_status)
    }

    /// Total accessor for the matcher: absent descriptive fields read as the
    /// empty string, never as a fault.
    pub fn field_value(&self, field: ConditionField) -> &str {
        let value = match field {
            ConditionField::CounterpartName => self.counterpart_name.as_deref(),
            ConditionField::CounterpartIban => self.counterpart_iban.as_deref(),
            ConditionField::Purpose => self.purpose.as_deref(),
            ConditionField::BookingText => self.booking_text.as_deref(),
            ConditionField::Unknown => None,
        };
        value.unwrap_or("")
    }
}

// ============================================================================
// Rule Models
// ============================================================================

/// Transaction field a condition reads. Closed set; anything else a stored
/// condition names resolves to `Unknown` and reads as empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionField {
    CounterpartName,
    CounterpartIban,
    Purpose,
    BookingText,
    Unknown,
}

impl ConditionField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CounterpartName => "counterpart_name",
            Self::CounterpartIban => "counterpart_iban",
            Self::Purpose => "purpose",
            Self::BookingText => "booking_text",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "counterpart_name" => Self::CounterpartName,
            "counterpart_iban" => Self::CounterpartIban,
            "purpose" => Self::Purpose,
            "booking_text" => Self::BookingText,
            _ => Self::Unknown,
        }
    }

    /// Fields whose empty value falls back to `booking_text`: banks often
    /// leave the structured counterpart/purpose fields blank while the
    /// free-text narrative carries the information.
    pub fn falls_back_to_booking_text(&self) -> bool {
        matches!(self, Self::CounterpartName | Self::Purpose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    Unknown,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "equals" => Self::Equals,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            _ => Self::Unknown,
        }
    }
}

/// One field condition of a rule. Field and operator stay strings on the
/// wire and in storage; they are resolved through the closed enums at match
/// time, so an unrecognized value can never fail a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: String,
    pub value: String,
}

/// What a rule writes when it fires. Stored as JSONB `{type, config}`; every
/// variant admits a `building_id` merged uniformly into its config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum RuleAction {
    AssignTenant {
        tenant_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_id: Option<Uuid>,
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        transaction_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        building_id: Option<Uuid>,
    },
    BookAs {
        #[serde(rename = "type")]
        transaction_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        building_id: Option<Uuid>,
    },
    Ignore {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        building_id: Option<Uuid>,
    },
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssignTenant { .. } => "assign_tenant",
            Self::BookAs { .. } => "book_as",
            Self::Ignore { .. } => "ignore",
        }
    }

    pub fn building_id(&self) -> Option<Uuid> {
        match self {
            Self::AssignTenant { building_id, .. }
            | Self::BookAs { building_id, .. }
            | Self::Ignore { building_id } => *building_id,
        }
    }
}

/// A reusable, named matching policy: ANDed conditions plus one action, with
/// usage statistics advanced on every committed application.
#[derive(Debug, Clone, FromRow)]
pub struct MatchRule {
    pub rule_id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub conditions: Json<Vec<RuleCondition>>,
    pub action: Json<RuleAction>,
    pub match_count: i64,
    pub last_match_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}
