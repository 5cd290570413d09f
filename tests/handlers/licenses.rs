use axum::http::StatusCode;
use serde_json::json;

use scanguard::handlers::router;

use crate::common::*;
use crate::send;

fn seed(app: &TestApp) {
    let mut record = license_record("LK-1", "cust-a", job_balance(5, ExhaustionModel::Block));
    record.event_driven = Some(EventDrivenTerms {
        active: true,
        quota_minutes: 60,
        clouds: ["aws".to_string(), "gcp".to_string()].into(),
        last_execution: None,
    });
    seed_license(&app.state.db, &record);
    seed_license(
        &app.state.db,
        &license_record("LK-2", "cust-b", time_range("P30D")),
    );
}

#[tokio::test]
async fn test_list_and_get_license() {
    let app = create_test_app();
    seed(&app);

    let (status, body) = send(router(app.state.clone()), "GET", "/licenses", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["LK-1", "LK-2"]));

    let (status, body) = send(router(app.state.clone()), "GET", "/licenses/LK-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["license_key"], "LK-1");
    assert_eq!(body["customers"]["cust-a"]["mode"], "JOB_BALANCE");
    assert_eq!(body["customers"]["cust-a"]["job_balance"], 5);
    assert!(body["customers"]["cust-a"].get("version").is_none());

    let (status, _) = send(router(app.state), "GET", "/licenses/LK-404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_customer_quotas() {
    let app = create_test_app();
    seed(&app);

    let (status, body) = send(
        router(app.state.clone()),
        "GET",
        "/licenses/LK-1/customers/cust-a/quotas",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let clouds: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["cloud"].as_str().unwrap())
        .collect();
    assert_eq!(clouds, ["aws", "gcp"]);

    let (status, _) = send(
        router(app.state),
        "GET",
        "/licenses/LK-1/customers/cust-z/quotas",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_license() {
    let app = create_test_app();
    seed(&app);

    let (status, body) = send(router(app.state.clone()), "DELETE", "/licenses/LK-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, serde_json::Value::Null);

    let (status, _) = send(router(app.state.clone()), "DELETE", "/licenses/LK-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        router(app.state),
        "POST",
        "/jobs/admission",
        Some(json!({ "customer_id": "cust-a", "license_key": "LK-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_delete_customer() {
    let app = create_test_app();
    seed(&app);

    let (status, body) = send(router(app.state.clone()), "DELETE", "/customers/cust-b", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "allowances": 1, "licenses": 1 }));

    let (status, _) = send(router(app.state.clone()), "DELETE", "/customers/cust-b", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(router(app.state), "GET", "/licenses", None).await;
    assert_eq!(body, json!(["LK-1"]));
}

#[tokio::test]
async fn test_rules_and_rulesets() {
    let app = create_test_app();
    {
        let conn = app.state.db.get().unwrap();
        queries::upsert_rule(&conn, &rule("S3_001", "HIGH"), start_time()).unwrap();
        queries::upsert_ruleset(&conn, &ruleset("aws-core", "1.0"), start_time()).unwrap();
    }

    let (status, body) = send(router(app.state.clone()), "GET", "/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["rule_id"], "S3_001");

    let (status, body) = send(router(app.state.clone()), "GET", "/rules/S3_001", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["severity"], "HIGH");

    let (status, _) = send(router(app.state.clone()), "GET", "/rules/NOPE", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(router(app.state), "GET", "/rulesets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["ruleset_id"], "aws-core");
    assert_eq!(body[0]["version"], "1.0");
}
