use std::sync::{Arc, Barrier};
use std::thread;

use scanguard::admission::{EventDrivenAdmission, EventDrivenRequest};

use crate::common::*;

const WORKERS: usize = 12;

fn racing_admissions(ledger: Arc<LicenseAllowanceLedger>) -> Vec<Result<Decision>> {
    let barrier = Barrier::new(WORKERS);
    thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    ledger.admit("cust-a", "LK-1")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_last_job_goes_to_exactly_one_caller() {
    let db = test_db();
    seed_license(
        &db.pool,
        &license_record("LK-1", "cust-a", job_balance(1, ExhaustionModel::Block)),
    );
    let ledger = Arc::new(LicenseAllowanceLedger::new(
        db.pool.clone(),
        test_clock(),
        LedgerConfig {
            max_admission_retries: 100,
            ..LedgerConfig::default()
        },
    ));

    let results = racing_admissions(ledger);
    let allowed = results
        .iter()
        .filter(|r| matches!(r, Ok(d) if d.allow))
        .count();
    let exhausted = results
        .iter()
        .filter(|r| {
            matches!(r, Ok(d) if !d.allow && d.reason.as_deref() == Some(REASON_BALANCE_EXHAUSTED))
        })
        .count();

    assert_eq!(allowed, 1);
    assert_eq!(exhausted, WORKERS - 1);
}

#[test]
fn test_balance_is_never_overspent() {
    let db = test_db();
    seed_license(
        &db.pool,
        &license_record("LK-1", "cust-a", job_balance(5, ExhaustionModel::Block)),
    );
    let ledger = Arc::new(LicenseAllowanceLedger::new(
        db.pool.clone(),
        test_clock(),
        LedgerConfig {
            max_admission_retries: 0,
            ..LedgerConfig::default()
        },
    ));

    let results = racing_admissions(ledger);
    let allowed = results
        .iter()
        .filter(|r| matches!(r, Ok(d) if d.allow))
        .count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::ConcurrencyConflict { attempts: 1 })))
        .count();
    assert!(allowed <= 5);
    assert!(results.iter().all(|r| match r {
        Ok(_) => true,
        Err(e) => e.is_transient(),
    }));

    let conn = db.pool.get().unwrap();
    let entry = queries::get_ledger_entry(&conn, "LK-1", "cust-a")
        .unwrap()
        .unwrap();
    let remaining = entry.allowance.job_balance.unwrap();
    assert_eq!(remaining, 5 - allowed as i64);
    assert!(remaining >= 0);
    assert!(allowed + conflicts <= WORKERS);
}

#[test]
fn test_stale_version_loses() {
    let db = test_db();
    seed_license(
        &db.pool,
        &license_record("LK-1", "cust-a", job_balance(3, ExhaustionModel::Block)),
    );
    let conn = db.pool.get().unwrap();
    let entry = queries::get_ledger_entry(&conn, "LK-1", "cust-a")
        .unwrap()
        .unwrap();
    let version = entry.allowance.version;

    assert!(queries::try_consume_job(&conn, "LK-1", "cust-a", version).unwrap());
    assert!(!queries::try_consume_job(&conn, "LK-1", "cust-a", version).unwrap());
    assert!(queries::try_consume_job(&conn, "LK-1", "cust-a", version + 1).unwrap());
}

fn racing_event_driven(gate: Arc<JobAdmissionGate>) -> Vec<Result<EventDrivenAdmission>> {
    let barrier = Barrier::new(WORKERS);
    let request = EventDrivenRequest {
        customer_id: "cust-a".into(),
        license_key: "LK-1".into(),
        clouds: vec!["aws".into()],
        minutes: 5,
    };
    thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let gate = gate.clone();
                let barrier = &barrier;
                let request = &request;
                scope.spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .build()
                        .unwrap();
                    barrier.wait();
                    rt.block_on(gate.admit_event_driven(request))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_denied_event_driven_jobs_charge_no_minutes() {
    let db = test_db();
    let mut record = license_record("LK-1", "cust-a", job_balance(1, ExhaustionModel::Block));
    record.event_driven = Some(EventDrivenTerms {
        active: true,
        quota_minutes: 10_000,
        clouds: ["aws".to_string()].into(),
        last_execution: None,
    });
    seed_license(&db.pool, &record);
    let gate = Arc::new(JobAdmissionGate::new(
        test_ledger(&db.pool, test_clock()),
        DecisionSource::Ledger,
    ));

    let results = racing_event_driven(gate);
    let admitted = results
        .iter()
        .filter(|r| matches!(r, Ok(a) if a.admitted == ["aws"]))
        .count();
    let denied = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::LicenseDenied(_))))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(denied, WORKERS - 1);

    let conn = db.pool.get().unwrap();
    let quota = queries::get_event_driven_quota(&conn, "LK-1", "cust-a", "aws")
        .unwrap()
        .unwrap();
    assert_eq!(quota.consumed_minutes, 5);
    let entry = queries::get_ledger_entry(&conn, "LK-1", "cust-a")
        .unwrap()
        .unwrap();
    assert_eq!(entry.allowance.job_balance, Some(0));
}
