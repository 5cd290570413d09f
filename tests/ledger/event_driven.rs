use chrono::Duration;

use crate::common::*;

fn seed_event_driven(pool: &DbPool, active: bool, quota_minutes: i64) {
    let mut record = license_record("LK-1", "cust-a", job_balance(10, ExhaustionModel::Block));
    record.event_driven = Some(EventDrivenTerms {
        active,
        quota_minutes,
        clouds: ["aws".to_string(), "gcp".to_string()].into(),
        last_execution: None,
    });
    seed_license(pool, &record);
}

fn consumed(pool: &DbPool, cloud: &str) -> i64 {
    let conn = pool.get().unwrap();
    queries::get_event_driven_quota(&conn, "LK-1", "cust-a", cloud)
        .unwrap()
        .unwrap()
        .consumed_minutes
}

#[test]
fn test_quota_is_charged_per_cloud() {
    let db = test_db();
    seed_event_driven(&db.pool, true, 60);
    let ledger = test_ledger(&db.pool, test_clock());

    assert!(ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 45).unwrap());
    assert!(!ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 20).unwrap());
    assert!(ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 15).unwrap());
    assert!(ledger.can_consume_event_driven("cust-a", "LK-1", "gcp", 60).unwrap());

    assert_eq!(consumed(&db.pool, "aws"), 60);
    assert_eq!(consumed(&db.pool, "gcp"), 60);
}

#[test]
fn test_window_resets_usage() {
    let db = test_db();
    seed_event_driven(&db.pool, true, 60);
    let clock = test_clock();
    let ledger = test_ledger(&db.pool, clock.clone());

    assert!(ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 60).unwrap());
    clock.advance(Duration::hours(23));
    assert!(!ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 1).unwrap());

    clock.advance(Duration::hours(1));
    assert!(ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 30).unwrap());
    assert_eq!(consumed(&db.pool, "aws"), 30);

    let conn = db.pool.get().unwrap();
    let quota = queries::get_event_driven_quota(&conn, "LK-1", "cust-a", "aws")
        .unwrap()
        .unwrap();
    assert_eq!(quota.window_started_at, Some(start_time() + Duration::hours(24)));
    assert_eq!(quota.last_execution, Some(start_time() + Duration::hours(24)));
}

#[test]
fn test_inactive_or_missing_quota_refuses() {
    let db = test_db();
    seed_event_driven(&db.pool, false, 60);
    let ledger = test_ledger(&db.pool, test_clock());

    assert!(!ledger.can_consume_event_driven("cust-a", "LK-1", "aws", 1).unwrap());
    assert!(!ledger.can_consume_event_driven("cust-a", "LK-1", "azure", 1).unwrap());
    assert!(!ledger.can_consume_event_driven("cust-z", "LK-1", "aws", 1).unwrap());
    assert_eq!(consumed(&db.pool, "aws"), 0);
}

#[test]
fn test_negative_minutes_are_rejected() {
    let db = test_db();
    seed_event_driven(&db.pool, true, 60);
    let ledger = test_ledger(&db.pool, test_clock());

    assert!(matches!(
        ledger.can_consume_event_driven("cust-a", "LK-1", "aws", -5),
        Err(AppError::BadRequest(_))
    ));
}
