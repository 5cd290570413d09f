use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::error::{AppError, Result};
use crate::models::SigningAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Protocol {
    Http,
    Https,
}

/// Where the License Manager lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseManagerEndpoint {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: Protocol,
    /// Optional path prefix, e.g. `dev`
    #[serde(default)]
    pub stage: Option<String>,
}

impl LicenseManagerEndpoint {
    pub fn base_url(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        let mut url = format!("{}://{}", scheme, self.host.trim_end_matches('/'));
        if let Some(port) = self.port {
            url.push_str(&format!(":{}", port));
        }
        if let Some(stage) = self.stage.as_deref().map(|s| s.trim_matches('/'))
            && !stage.is_empty()
        {
            url.push('/');
            url.push_str(stage);
        }
        url
    }
}

/// How the sync job is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SchedulerMode {
    /// In-process tokio timer
    Interval,
    /// Cloud event rule, persisted for the deployment's rule reconciler
    EventRule,
}

/// Where the client private key is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCustody {
    /// Registered client key, decrypted in-process
    Local,
    /// Signing service holding `key_id`; the private key never reaches us
    Remote {
        endpoint: String,
        key_id: String,
        algorithm: SigningAlgorithm,
    },
}

/// Where admission decisions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AdmissionMode {
    /// Locally cached ledger, refreshed by sync
    Ledger,
    /// Ask the License Manager on every admission
    Authority,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tenant_id: String,
    pub interval: Duration,
    pub token_lifetime: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Optimistic update attempts before giving up with a conflict
    pub max_admission_retries: u32,
    pub event_driven_window: chrono::Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_admission_retries: 3,
            event_driven_window: chrono::Duration::days(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub object_store_path: String,
    /// Base64 of the 32-byte master key used to encrypt client keys at rest
    pub master_key: Option<String>,
    pub license_manager: LicenseManagerEndpoint,
    pub request_timeout: Duration,
    pub sync: SyncConfig,
    pub ledger: LedgerConfig,
    pub scheduler_mode: SchedulerMode,
    pub key_custody: KeyCustody,
    pub admission_mode: AdmissionMode,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_enum<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| AppError::Config(format!("invalid value for {}: {}", name, v))),
        Err(_) => Ok(default),
    }
}

fn env_required(name: &str) -> Result<String> {
    env::var(name)
        .map_err(|_| AppError::Config(format!("{} is required when KEY_CUSTODY=remote", name)))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env_parse("PORT").unwrap_or(3000);

        let license_manager = LicenseManagerEndpoint {
            host: env::var("LM_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_parse("LM_PORT"),
            protocol: env_enum("LM_PROTOCOL", Protocol::Https)?,
            stage: env::var("LM_STAGE").ok().filter(|s| !s.is_empty()),
        };

        let key_custody = match env::var("KEY_CUSTODY").as_deref() {
            Ok("remote") => KeyCustody::Remote {
                endpoint: env_required("KMS_ENDPOINT")?,
                key_id: env_required("KMS_KEY_ID")?,
                algorithm: env_enum("KMS_KEY_ALGORITHM", SigningAlgorithm::Es512)?,
            },
            Ok("local") | Err(_) => KeyCustody::Local,
            Ok(other) => {
                return Err(AppError::Config(format!(
                    "invalid value for KEY_CUSTODY: {}",
                    other
                )));
            }
        };

        let sync = SyncConfig {
            tenant_id: env::var("TENANT_ID").unwrap_or_else(|_| "default".to_string()),
            interval: Duration::from_secs(env_parse("SYNC_INTERVAL_SECS").unwrap_or(3 * 3600)),
            token_lifetime: chrono::Duration::seconds(
                env_parse("TOKEN_LIFETIME_SECS").unwrap_or(300),
            ),
        };

        let ledger = LedgerConfig {
            max_admission_retries: env_parse("ADMISSION_MAX_RETRIES").unwrap_or(3),
            event_driven_window: chrono::Duration::seconds(
                env_parse("EVENT_DRIVEN_WINDOW_SECS").unwrap_or(86400),
            ),
        };

        Ok(Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "scanguard.db".to_string()),
            object_store_path: env::var("OBJECT_STORE_PATH")
                .unwrap_or_else(|_| "scanguard-objects".to_string()),
            master_key: env::var("SCANGUARD_MASTER_KEY").ok(),
            license_manager,
            request_timeout: Duration::from_secs(env_parse("LM_TIMEOUT_SECS").unwrap_or(30)),
            sync,
            ledger,
            scheduler_mode: env_enum("SCHEDULER_MODE", SchedulerMode::Interval)?,
            key_custody,
            admission_mode: env_enum("ADMISSION_MODE", AdmissionMode::Ledger)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
