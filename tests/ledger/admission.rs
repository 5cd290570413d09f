use std::sync::Arc;

use scanguard::admission::EventDrivenRequest;

use crate::common::*;

fn ledger_gate(pool: &DbPool) -> JobAdmissionGate {
    JobAdmissionGate::new(test_ledger(pool, test_clock()), DecisionSource::Ledger)
}

fn authority_gate(pool: &DbPool, api: Arc<FakeLicenseManager>) -> JobAdmissionGate {
    JobAdmissionGate::new(
        test_ledger(pool, test_clock()),
        DecisionSource::Authority {
            api,
            issuer: local_issuer(pool),
            tenant_id: TENANT_ID.to_string(),
            token_lifetime: chrono::Duration::minutes(5),
        },
    )
}

fn balance_of(pool: &DbPool) -> i64 {
    let conn = pool.get().unwrap();
    queries::get_ledger_entry(&conn, "LK-1", "cust-a")
        .unwrap()
        .unwrap()
        .allowance
        .job_balance
        .unwrap()
}

fn seed_with_quota(pool: &DbPool, balance: i64, quota_minutes: i64) {
    let mut record = license_record("LK-1", "cust-a", job_balance(balance, ExhaustionModel::Block));
    record.event_driven = Some(EventDrivenTerms {
        active: true,
        quota_minutes,
        clouds: ["aws".to_string(), "gcp".to_string()].into(),
        last_execution: None,
    });
    seed_license(pool, &record);
}

fn event_request(clouds: &[&str], minutes: i64) -> EventDrivenRequest {
    EventDrivenRequest {
        customer_id: "cust-a".into(),
        license_key: "LK-1".into(),
        clouds: clouds.iter().map(|c| c.to_string()).collect(),
        minutes,
    }
}

#[tokio::test]
async fn test_gate_admits_then_denies() {
    let db = test_db();
    seed_license(
        &db.pool,
        &license_record("LK-1", "cust-a", job_balance(1, ExhaustionModel::Block)),
    );
    let gate = ledger_gate(&db.pool);

    let admission = gate.admit("cust-a", "LK-1").await.unwrap();
    assert!(admission.admitted);
    assert!(!admission.downgraded);

    let err = gate.admit("cust-a", "LK-1").await.unwrap_err();
    assert!(matches!(err, AppError::LicenseDenied(reason) if reason == REASON_BALANCE_EXHAUSTED));
}

#[tokio::test]
async fn test_gate_reports_downgrade() {
    let db = test_db();
    seed_license(
        &db.pool,
        &license_record("LK-1", "cust-a", job_balance(0, ExhaustionModel::Downgrade)),
    );
    let admission = ledger_gate(&db.pool).admit("cust-a", "LK-1").await.unwrap();
    assert!(admission.admitted);
    assert!(admission.downgraded);
    assert_eq!(admission.reason.as_deref(), Some(REASON_BALANCE_EXHAUSTED));
}

#[tokio::test]
async fn test_event_driven_skips_clouds_without_quota() {
    let db = test_db();
    seed_with_quota(&db.pool, 5, 30);
    let gate = ledger_gate(&db.pool);

    let admission = gate
        .admit_event_driven(&event_request(&["aws", "azure"], 20))
        .await
        .unwrap();
    assert_eq!(admission.admitted, ["aws"]);
    assert_eq!(admission.skipped, ["azure"]);
    assert_eq!(balance_of(&db.pool), 4);

    let admission = gate
        .admit_event_driven(&event_request(&["aws", "gcp"], 20))
        .await
        .unwrap();
    assert_eq!(admission.admitted, ["gcp"]);
    assert_eq!(admission.skipped, ["aws"]);
    assert_eq!(balance_of(&db.pool), 3);
}

#[tokio::test]
async fn test_event_driven_with_nothing_admitted_costs_no_job() {
    let db = test_db();
    seed_with_quota(&db.pool, 5, 10);
    let admission = ledger_gate(&db.pool)
        .admit_event_driven(&event_request(&["aws", "gcp"], 30))
        .await
        .unwrap();

    assert!(admission.admitted.is_empty());
    assert_eq!(admission.skipped, ["aws", "gcp"]);
    assert_eq!(balance_of(&db.pool), 5);
}

#[tokio::test]
async fn test_event_driven_requires_license_first() {
    let db = test_db();
    seed_with_quota(&db.pool, 0, 60);
    let err = ledger_gate(&db.pool)
        .admit_event_driven(&event_request(&["aws"], 5))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::LicenseDenied(_)));

    let conn = db.pool.get().unwrap();
    let quota = queries::get_event_driven_quota(&conn, "LK-1", "cust-a", "aws")
        .unwrap()
        .unwrap();
    assert_eq!(quota.consumed_minutes, 0);
}

#[tokio::test]
async fn test_authority_decides_without_touching_balance() {
    let db = test_db();
    seed_license(
        &db.pool,
        &license_record("LK-1", "cust-a", job_balance(1, ExhaustionModel::Block)),
    );
    let api = FakeLicenseManager::new();
    *api.permission.lock().unwrap() = Some(Decision::allowed());
    let gate = authority_gate(&db.pool, api.clone());

    for _ in 0..3 {
        assert!(gate.admit("cust-a", "LK-1").await.unwrap().admitted);
    }
    assert_eq!(balance_of(&db.pool), 1);

    // every call carried a token signed with the client key
    let tokens = api.tokens.lock().unwrap().clone();
    assert_eq!(tokens.len(), 3);
    assert!(ec_client().verify_at(&tokens[0], start_time()).is_ok());
}

#[tokio::test]
async fn test_authority_denial_and_outage() {
    let db = test_db();
    let api = FakeLicenseManager::new();
    let gate = authority_gate(&db.pool, api.clone());

    assert!(matches!(
        gate.admit("cust-a", "LK-1").await,
        Err(AppError::LicenseManager(_))
    ));

    *api.permission.lock().unwrap() = Some(Decision::denied("suspended"));
    assert!(matches!(
        gate.admit("cust-a", "LK-1").await,
        Err(AppError::LicenseDenied(reason)) if reason == "suspended"
    ));
}
