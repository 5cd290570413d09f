use scanguard::config::{LicenseManagerEndpoint, Protocol};
use scanguard::license_manager;

use crate::common::*;

#[test]
fn test_put_setting_reports_changes_only() {
    let db = test_db();
    let conn = db.pool.get().unwrap();

    assert!(queries::put_setting(&conn, "greeting", &"hello").unwrap());
    assert!(!queries::put_setting(&conn, "greeting", &"hello").unwrap());
    assert!(queries::put_setting(&conn, "greeting", &"hi").unwrap());
    assert_eq!(
        queries::get_setting::<String>(&conn, "greeting").unwrap(),
        Some("hi".to_string())
    );

    assert!(queries::delete_setting(&conn, "greeting").unwrap());
    assert!(!queries::delete_setting(&conn, "greeting").unwrap());
    assert_eq!(queries::get_setting::<String>(&conn, "greeting").unwrap(), None);
}

#[test]
fn test_stored_endpoint_overrides_environment() {
    let db = test_db();
    let conn = db.pool.get().unwrap();
    let from_env = LicenseManagerEndpoint {
        host: "lm.example.com".into(),
        port: None,
        protocol: Protocol::Https,
        stage: None,
    };

    assert_eq!(
        license_manager::resolve_endpoint(&conn, &from_env).unwrap(),
        from_env
    );

    let configured = LicenseManagerEndpoint {
        host: "10.0.0.5".into(),
        port: Some(8080),
        protocol: Protocol::Http,
        stage: Some("dev".into()),
    };
    assert!(license_manager::save_endpoint(&conn, &configured).unwrap());
    let resolved = license_manager::resolve_endpoint(&conn, &from_env).unwrap();
    assert_eq!(resolved.base_url(), "http://10.0.0.5:8080/dev");

    assert!(license_manager::clear_endpoint(&conn).unwrap());
    assert_eq!(
        license_manager::resolve_endpoint(&conn, &from_env).unwrap(),
        from_env
    );
}

#[test]
fn test_sync_records_keep_last_success() {
    let db = test_db();
    let conn = db.pool.get().unwrap();
    let t0 = start_time();
    let t1 = t0 + chrono::Duration::hours(3);

    queries::record_sync_attempt(&conn, SyncStage::License, t0, None).unwrap();
    queries::record_sync_attempt(&conn, SyncStage::RuleMetadata, t1, None).unwrap();
    queries::record_sync_attempt(&conn, SyncStage::License, t1, Some("timeout")).unwrap();

    let records = queries::list_sync_records(&conn).unwrap();
    assert_eq!(
        records.iter().map(|r| r.stage).collect::<Vec<_>>(),
        [SyncStage::RuleMetadata, SyncStage::License]
    );
    let license = &records[1];
    assert!(!license.succeeded);
    assert_eq!(license.last_attempt_at, t1);
    assert_eq!(license.last_error.as_deref(), Some("timeout"));
    assert_eq!(license.last_success_at, Some(t0));
}
