//! Integration tests for retroactive rule application.

mod common;

use common::spawn_app;
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

fn contains_condition(value: &str) -> serde_json::Value {
    json!([{ "field": "counterpart_name", "operator": "contains", "value": value }])
}

#[tokio::test]
#[serial]
async fn preview_returns_only_eligible_matches_and_mutates_nothing() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;

    let eligible = app
        .seed_transaction(account, Some("Anna Schmidt"), Some("Miete Januar"), None)
        .await;
    let already_auto = app
        .seed_transaction(account, Some("Anna Schmidt"), Some("Miete Dezember"), None)
        .await;
    let also_auto = app
        .seed_transaction(account, Some("Anna Schmidt"), Some("Miete November"), None)
        .await;
    for txn in [already_auto, also_auto] {
        sqlx::query("UPDATE bank_transactions SET match_status = 'auto', matched_at = NOW() WHERE transaction_id = $1")
            .bind(txn)
            .execute(&app.pool)
            .await
            .unwrap();
    }

    let rule_id = app
        .create_rule(
            contains_condition("schmidt"),
            json!({ "type": "book_as", "config": { "type": "rent" } }),
        )
        .await;

    let response = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({ "preview": true }))
        .await;
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["total"], 1);
    assert_eq!(body["matches"][0]["id"], eligible.to_string());
    assert_eq!(body["matches"][0]["counterpart_name"], "Anna Schmidt");
    assert_eq!(body["matches"][0]["amount_cents"], -85000);

    // preview changes nothing, not even rule stats
    let (status, ..) = app.classification(eligible).await;
    assert_eq!(status, "unmatched");
    let (match_count, last_match_at) = app.rule_stats(rule_id).await;
    assert_eq!(match_count, 0);
    assert!(last_match_at.is_none());
}

#[tokio::test]
#[serial]
async fn commit_applies_book_as_rule_and_advances_stats() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;

    let mut txns = Vec::new();
    for purpose in ["Abschlag Strom", "Abschlag Gas", "Abschlag Wasser", "Abschlag Strom", "Abschlag Gas"] {
        txns.push(
            app.seed_transaction(account, Some("Stadtwerke Berlin"), Some(purpose), None)
                .await,
        );
    }

    let rule_id = app
        .create_rule(
            contains_condition("stadtwerke"),
            json!({ "type": "book_as", "config": { "type": "utilities" } }),
        )
        .await;

    let response = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await;
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["applied"], 5);

    for txn in &txns {
        let (status, confidence, matched_by, tenant_id, _, txn_type) =
            app.classification(*txn).await;
        assert_eq!(status, "auto");
        assert_eq!(confidence, Some(0.95));
        assert_eq!(matched_by, Some(app.user_id));
        assert_eq!(tenant_id, None);
        assert_eq!(txn_type.as_deref(), Some("utilities"));
    }

    let (match_count, last_match_at) = app.rule_stats(rule_id).await;
    assert_eq!(match_count, 5);
    assert!(last_match_at.is_some());
}

#[tokio::test]
#[serial]
async fn applying_the_same_rule_twice_is_idempotent() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;
    app.seed_transaction(account, Some("Anna Schmidt"), None, None)
        .await;

    let rule_id = app
        .create_rule(
            contains_condition("schmidt"),
            json!({ "type": "book_as", "config": { "type": "rent" } }),
        )
        .await;

    let first: serde_json::Value = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["applied"], 1);

    let second: serde_json::Value = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(second["applied"], 0);

    let (match_count, _) = app.rule_stats(rule_id).await;
    assert_eq!(match_count, 1);
}

#[tokio::test]
#[serial]
async fn explicit_transaction_ids_restrict_the_commit() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;

    let keep_a = app
        .seed_transaction(account, Some("Anna Schmidt"), Some("Miete Januar"), None)
        .await;
    let keep_b = app
        .seed_transaction(account, Some("Anna Schmidt"), Some("Miete Februar"), None)
        .await;
    let deselected = app
        .seed_transaction(account, Some("Anna Schmidt"), Some("Miete Maerz"), None)
        .await;

    let rule_id = app
        .create_rule(
            contains_condition("schmidt"),
            json!({ "type": "book_as", "config": { "type": "rent" } }),
        )
        .await;

    let body: serde_json::Value = app
        .post(
            &format!("/v1/rules/{rule_id}/apply"),
            &json!({ "transaction_ids": [keep_a, keep_b] }),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["applied"], 2);

    let (status, ..) = app.classification(deselected).await;
    assert_eq!(status, "unmatched");
}

#[tokio::test]
#[serial]
async fn assign_tenant_rule_writes_tenant_and_rent_category() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;
    let txn = app
        .seed_transaction(account, Some("Anna Schmidt"), None, None)
        .await;

    let tenant = Uuid::new_v4();
    let lease = Uuid::new_v4();
    let rule_id = app
        .create_rule(
            contains_condition("schmidt"),
            json!({
                "type": "assign_tenant",
                "config": { "tenant_id": tenant, "lease_id": lease }
            }),
        )
        .await;

    let body: serde_json::Value = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["applied"], 1);

    let (status, confidence, _, tenant_id, lease_id, txn_type) = app.classification(txn).await;
    assert_eq!(status, "auto");
    assert_eq!(confidence, Some(0.95));
    assert_eq!(tenant_id, Some(tenant));
    assert_eq!(lease_id, Some(lease));
    assert_eq!(txn_type.as_deref(), Some("rent"));
}

#[tokio::test]
#[serial]
async fn ignore_rule_parks_transactions_without_assignment() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;
    let txn = app
        .seed_transaction(account, Some("Kontofuehrung"), None, None)
        .await;

    let rule_id = app
        .create_rule(
            contains_condition("kontofuehrung"),
            json!({ "type": "ignore", "config": {} }),
        )
        .await;

    let body: serde_json::Value = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["applied"], 1);

    let (status, confidence, matched_by, tenant_id, _, txn_type) = app.classification(txn).await;
    assert_eq!(status, "ignored");
    assert_eq!(confidence, Some(0.95));
    assert_eq!(matched_by, Some(app.user_id));
    assert_eq!(tenant_id, None);
    assert_eq!(txn_type, None);
}

#[tokio::test]
#[serial]
async fn fallback_field_matching_applies_end_to_end() {
    let Some(app) = spawn_app().await else { return };
    let account = app.seed_account().await;
    // counterpart_name empty, narrative populated: equals degrades to
    // contains against booking_text
    let txn = app
        .seed_transaction(account, Some(""), Some(""), Some("MIETE SCHMIDT JAN"))
        .await;

    let rule_id = app
        .create_rule(
            json!([{ "field": "counterpart_name", "operator": "equals", "value": "schmidt" }]),
            json!({ "type": "book_as", "config": { "type": "rent" } }),
        )
        .await;

    let body: serde_json::Value = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["applied"], 1);

    let (status, ..) = app.classification(txn).await;
    assert_eq!(status, "auto");
}

#[tokio::test]
#[serial]
async fn unknown_rule_is_not_found() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .post(&format!("/v1/rules/{}/apply", Uuid::new_v4()), &json!({}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn foreign_organization_rule_is_not_found() {
    let Some(app) = spawn_app().await else { return };

    // a rule owned by a different organization
    let foreign_rule = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO match_rules (rule_id, organization_id, name, conditions, action)
        VALUES ($1, $2, 'Foreign', '[{"field":"purpose","operator":"contains","value":"miete"}]',
                '{"type":"book_as","config":{"type":"rent"}}')
        "#,
    )
    .bind(foreign_rule)
    .bind(Uuid::new_v4())
    .execute(&app.pool)
    .await
    .unwrap();

    let response = app
        .post(&format!("/v1/rules/{foreign_rule}/apply"), &json!({}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn rule_never_touches_other_organizations_transactions() {
    let Some(app) = spawn_app().await else { return };
    let foreign_account = app.seed_account_for(Uuid::new_v4()).await;
    let foreign_txn = app
        .seed_transaction(foreign_account, Some("Anna Schmidt"), None, None)
        .await;

    let rule_id = app
        .create_rule(
            contains_condition("schmidt"),
            json!({ "type": "book_as", "config": { "type": "rent" } }),
        )
        .await;

    let body: serde_json::Value = app
        .post(&format!("/v1/rules/{rule_id}/apply"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["applied"], 0);

    let (status, ..) = app.classification(foreign_txn).await;
    assert_eq!(status, "unmatched");
}
