//! Common test utilities for matching-service integration tests.
//!
//! The suites exercise a real application over HTTP against PostgreSQL.
//! They are gated on `TEST_DATABASE_URL`: without it `spawn_app` returns
//! `None` and each test skips instead of failing, so the pure unit suites
//! stay runnable anywhere.

use chrono::{DateTime, NaiveDate, Utc};
use matching_service::config::{DatabaseConfig, MatchingConfig};
use matching_service::startup::Application;
use platform_core::config::Config as CommonConfig;
use sqlx::PgPool;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,matching_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config(database_url: String) -> MatchingConfig {
    MatchingConfig {
        common: CommonConfig { port: 0 },
        service_name: "matching-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url,
            max_connections: 2,
            min_connections: 1,
        },
    }
}

/// Test application wrapper: a running server, a seeded caller and direct
/// pool access for seeding and assertions.
#[allow(dead_code)]
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub pool: PgPool,
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

/// Spawn a test application with a fresh caller profile, or `None` when no
/// test database is configured.
pub async fn spawn_app() -> Option<TestApp> {
    init_tracing();

    let database_url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return None;
        }
    };

    let app = Application::build(test_config(database_url))
        .await
        .expect("Failed to build application");

    let port = app.port();
    let pool = app.db().pool().clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let organization_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO profiles (user_id, organization_id) VALUES ($1, $2)")
        .bind(user_id)
        .bind(organization_id)
        .execute(&pool)
        .await
        .expect("Failed to seed caller profile");

    Some(TestApp {
        address: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        pool,
        user_id,
        organization_id,
    })
}

#[allow(dead_code)]
impl TestApp {
    pub async fn post(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("x-user-id", self.user_id.to_string())
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .header("x-user-id", self.user_id.to_string())
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Seed a bank account (with its connection) for the caller's
    /// organization and return the account id.
    pub async fn seed_account(&self) -> Uuid {
        self.seed_account_for(self.organization_id).await
    }

    /// Seed a bank account belonging to an arbitrary organization.
    pub async fn seed_account_for(&self, organization_id: Uuid) -> Uuid {
        let connection_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO bank_connections (connection_id, organization_id, provider) VALUES ($1, $2, 'test-bank')",
        )
        .bind(connection_id)
        .bind(organization_id)
        .execute(&self.pool)
        .await
        .expect("Failed to seed bank connection");

        sqlx::query(
            "INSERT INTO bank_accounts (account_id, connection_id, iban, display_name) VALUES ($1, $2, 'DE02120300000000202051', 'Mietkonto')",
        )
        .bind(account_id)
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .expect("Failed to seed bank account");

        account_id
    }

    /// Seed an unmatched transaction and return its id.
    pub async fn seed_transaction(
        &self,
        account_id: Uuid,
        counterpart_name: Option<&str>,
        purpose: Option<&str>,
        booking_text: Option<&str>,
    ) -> Uuid {
        let transaction_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO bank_transactions
                (transaction_id, account_id, counterpart_name, purpose, booking_text,
                 amount_cents, booking_date, currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'EUR')
            "#,
        )
        .bind(transaction_id)
        .bind(account_id)
        .bind(counterpart_name)
        .bind(purpose)
        .bind(booking_text)
        .bind(-85000i64)
        .bind(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap())
        .execute(&self.pool)
        .await
        .expect("Failed to seed transaction");
        transaction_id
    }

    /// Fetch the classification columns of a transaction:
    /// (status, confidence, matched_by, tenant, lease, type).
    pub async fn classification(
        &self,
        transaction_id: Uuid,
    ) -> (
        String,
        Option<f64>,
        Option<Uuid>,
        Option<Uuid>,
        Option<Uuid>,
        Option<String>,
    ) {
        sqlx::query_as(
            r#"
            SELECT match_status, match_confidence, matched_by, matched_tenant_id,
                   matched_lease_id, transaction_type
            FROM bank_transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_one(&self.pool)
        .await
        .expect("Failed to fetch transaction")
    }

    /// Fetch a rule's usage statistics: (match_count, last_match_at).
    pub async fn rule_stats(&self, rule_id: Uuid) -> (i64, Option<DateTime<Utc>>) {
        sqlx::query_as("SELECT match_count, last_match_at FROM match_rules WHERE rule_id = $1")
            .bind(rule_id)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to fetch rule stats")
    }

    /// Create a rule through the API and return its id.
    pub async fn create_rule(
        &self,
        conditions: serde_json::Value,
        action: serde_json::Value,
    ) -> Uuid {
        let response = self
            .post(
                "/v1/rules",
                &serde_json::json!({ "conditions": conditions, "action": action }),
            )
            .await;
        assert!(
            response.status().is_success(),
            "rule creation failed: {}",
            response.status()
        );
        let body: serde_json::Value = response.json().await.expect("Invalid rule response");
        Uuid::parse_str(body["rule"]["id"].as_str().expect("rule id missing"))
            .expect("rule id not a uuid")
    }
}
