//! Shared test helpers: databases, fixture keys, a scripted License Manager.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

pub use scanguard::admission::{DecisionSource, JobAdmissionGate};
pub use scanguard::config::{LedgerConfig, SyncConfig};
pub use scanguard::crypto::{MasterKey, sha256_hex};
pub use scanguard::db::{AppState, DbPool, create_pool, queries};
pub use scanguard::error::{AppError, Result};
pub use scanguard::jwt::{RegisteredClientKey, TokenIssuer, TrustTokenClient};
pub use scanguard::ledger::LicenseAllowanceLedger;
pub use scanguard::license_manager::{LicenseManagerApi, PermissionRequest};
pub use scanguard::models::*;
pub use scanguard::storage::{MemoryObjectStore, ObjectStore};
pub use scanguard::sync::LicenseSyncCoordinator;
pub use scanguard::util::{Clock, ManualClock};

pub const TENANT_ID: &str = "tenant-1";
pub const KEY_ID: &str = "client-key-1";

pub fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("missing fixture {path}: {e}"))
}

pub fn ec_client() -> TrustTokenClient {
    TrustTokenClient::load_from_pem(KEY_ID, fixture("ec_p521.pem").as_bytes()).unwrap()
}

pub fn rsa_client() -> TrustTokenClient {
    TrustTokenClient::load_from_pem(KEY_ID, fixture("rsa_2048.pem").as_bytes()).unwrap()
}

pub fn test_master_key() -> MasterKey {
    MasterKey::from_bytes(&[7u8; 32]).unwrap()
}

/// Register `fixture_name` as the tenant's client key, replacing any other.
pub fn register_client_key(
    pool: &DbPool,
    key_id: &str,
    algorithm: SigningAlgorithm,
    fixture_name: &str,
) -> ClientKeyInfo {
    let input = CreateClientKey {
        key_id: key_id.to_string(),
        algorithm,
        private_key: fixture(fixture_name),
        b64_encoded: false,
    };
    queries::create_client_key(&mut pool.get().unwrap(), &input, &test_master_key()).unwrap()
}

/// Issuer reading the registered client key from `pool`, seeded with the EC fixture.
pub fn local_issuer(pool: &DbPool) -> Arc<TokenIssuer> {
    register_client_key(pool, KEY_ID, SigningAlgorithm::Es512, "ec_p521.pem");
    let source = RegisteredClientKey::new(pool.clone(), test_master_key());
    Arc::new(TokenIssuer::Local(Arc::new(source)))
}

/// A file-backed pool; concurrency tests need real WAL connections, not `:memory:`.
pub struct TestDb {
    pub pool: DbPool,
    _dir: TempDir,
}

pub fn test_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scanguard.db");
    let pool = create_pool(path.to_str().unwrap(), 16).unwrap();
    TestDb { pool, _dir: dir }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// 2026-01-01T00:00:00Z
pub fn start_time() -> DateTime<Utc> {
    at(1_767_225_600)
}

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

pub fn job_balance(balance: i64, exhaustion_model: ExhaustionModel) -> AllowanceTerms {
    AllowanceTerms {
        mode: Some(AllowanceMode::JobBalance),
        job_balance: Some(balance),
        exhaustion_model,
        ..Default::default()
    }
}

pub fn time_range(range: &str) -> AllowanceTerms {
    AllowanceTerms {
        mode: Some(AllowanceMode::TimeRange),
        time_range: Some(range.to_string()),
        ..Default::default()
    }
}

/// License with one customer on the given terms.
pub fn license_record(
    license_key: &str,
    customer_id: &str,
    terms: AllowanceTerms,
) -> LicenseRecord {
    LicenseRecord {
        license_key: license_key.to_string(),
        ruleset_ids: ["aws-core".to_string()].into(),
        customers: [(customer_id.to_string(), Some(terms))].into(),
        ..Default::default()
    }
}

pub fn seed_license(pool: &DbPool, record: &LicenseRecord) {
    let mut conn = pool.get().unwrap();
    queries::apply_license_record(&mut conn, record, start_time()).unwrap();
}

pub fn test_ledger(pool: &DbPool, clock: Arc<ManualClock>) -> Arc<LicenseAllowanceLedger> {
    Arc::new(LicenseAllowanceLedger::new(
        pool.clone(),
        clock,
        LedgerConfig::default(),
    ))
}

pub fn sync_config() -> SyncConfig {
    SyncConfig {
        tenant_id: TENANT_ID.to_string(),
        interval: StdDuration::from_secs(3600),
        token_lifetime: Duration::minutes(5),
    }
}

pub fn rule(rule_id: &str, severity: &str) -> RuleMetadata {
    RuleMetadata {
        rule_id: rule_id.to_string(),
        severity: severity.to_string(),
        category: Some("storage".to_string()),
        standards: [("CIS".to_string(), vec!["2.1.1".to_string()])].into(),
        mitre: Default::default(),
        remediation: Some("Enable encryption".to_string()),
    }
}

pub fn ruleset(ruleset_id: &str, version: &str) -> RulesetMetadata {
    RulesetMetadata {
        ruleset_id: ruleset_id.to_string(),
        name: format!("{ruleset_id} rules"),
        version: version.to_string(),
        cloud: "aws".to_string(),
        rules: vec!["S3_001".to_string()],
        license_keys: vec!["LK-1".to_string()],
    }
}

pub fn artifact(ruleset_id: &str, version: &str, content: &[u8]) -> (ArtifactRef, Vec<u8>) {
    (
        ArtifactRef {
            ruleset_id: ruleset_id.to_string(),
            version: version.to_string(),
            sha256: Some(sha256_hex(content)),
        },
        content.to_vec(),
    )
}

/// In-process License Manager whose answers tests script directly.
#[derive(Default)]
pub struct FakeLicenseManager {
    pub rules: Mutex<Vec<RuleMetadata>>,
    pub licenses: Mutex<Vec<LicenseRecord>>,
    pub artifacts: Mutex<Vec<(ArtifactRef, Vec<u8>)>>,
    pub rulesets: Mutex<Vec<RulesetMetadata>>,
    pub failing: Mutex<HashSet<SyncStage>>,
    pub permission: Mutex<Option<Decision>>,
    pub tokens: Mutex<Vec<String>>,
    pub downloads: AtomicUsize,
    pub delay: Mutex<Option<StdDuration>>,
}

impl FakeLicenseManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, stage: SyncStage) {
        self.failing.lock().unwrap().insert(stage);
    }

    pub fn recover(&self, stage: SyncStage) {
        self.failing.lock().unwrap().remove(&stage);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check(&self, token: &str, stage: SyncStage) -> Result<()> {
        self.tokens.lock().unwrap().push(token.to_string());
        if self.failing.lock().unwrap().contains(&stage) {
            return Err(AppError::LicenseManager(format!("{stage} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl LicenseManagerApi for FakeLicenseManager {
    async fn fetch_rule_metadata(&self, token: &str) -> Result<Vec<RuleMetadata>> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(token, SyncStage::RuleMetadata)?;
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn fetch_licenses(&self, token: &str) -> Result<Vec<LicenseRecord>> {
        self.check(token, SyncStage::License)?;
        Ok(self.licenses.lock().unwrap().clone())
    }

    async fn list_ruleset_artifacts(&self, token: &str) -> Result<Vec<ArtifactRef>> {
        self.check(token, SyncStage::RulesetArtifacts)?;
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn download_artifact(&self, token: &str, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.check(token, SyncStage::RulesetArtifacts)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.artifacts
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a == artifact)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| AppError::LicenseManager("no such artifact".into()))
    }

    async fn fetch_ruleset_metadata(&self, token: &str) -> Result<Vec<RulesetMetadata>> {
        self.check(token, SyncStage::RulesetMetadata)?;
        Ok(self.rulesets.lock().unwrap().clone())
    }

    async fn check_permission(
        &self,
        token: &str,
        _request: &PermissionRequest,
    ) -> Result<Decision> {
        self.tokens.lock().unwrap().push(token.to_string());
        self.permission
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::LicenseManager("permission endpoint unavailable".into()))
    }
}

/// Everything a sync test needs to poke at.
pub struct SyncHarness {
    pub db: TestDb,
    pub api: Arc<FakeLicenseManager>,
    pub objects: Arc<MemoryObjectStore>,
    pub clock: Arc<ManualClock>,
    pub client: TrustTokenClient,
    pub coordinator: Arc<LicenseSyncCoordinator>,
}

pub fn sync_harness() -> SyncHarness {
    let db = test_db();
    let api = FakeLicenseManager::new();
    let objects = Arc::new(MemoryObjectStore::new());
    let clock = test_clock();
    let client = ec_client();
    let coordinator = Arc::new(LicenseSyncCoordinator::new(
        api.clone(),
        local_issuer(&db.pool),
        db.pool.clone(),
        objects.clone(),
        clock.clone(),
        sync_config(),
    ));
    SyncHarness {
        db,
        api,
        objects,
        clock,
        client,
        coordinator,
    }
}

/// App state backed by a fake License Manager, admitting from the ledger.
pub struct TestApp {
    pub state: AppState,
    pub harness: SyncHarness,
}

pub fn create_test_app() -> TestApp {
    let harness = sync_harness();
    let ledger = test_ledger(&harness.db.pool, harness.clock.clone());
    let gate = Arc::new(JobAdmissionGate::new(ledger.clone(), DecisionSource::Ledger));
    let state = AppState {
        db: harness.db.pool.clone(),
        ledger,
        gate,
        coordinator: harness.coordinator.clone(),
    };
    TestApp { state, harness }
}
