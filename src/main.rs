use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use scanguard::admission::{DecisionSource, JobAdmissionGate};
use scanguard::config::{
    AdmissionMode, Config, KeyCustody, LicenseManagerEndpoint, Protocol, SchedulerMode,
};
use scanguard::crypto::MasterKey;
use scanguard::db::{self, AppState, DbPool, queries};
use scanguard::handlers;
use scanguard::jwt::{RegisteredClientKey, TokenIssuer};
use scanguard::kms::RemoteKms;
use scanguard::ledger::LicenseAllowanceLedger;
use scanguard::license_manager::{self, HttpLicenseManager};
use scanguard::models::{CreateClientKey, SigningAlgorithm, SyncOutcome};
use scanguard::scheduler::{EventRuleScheduler, IntervalScheduler, JobScheduler};
use scanguard::storage::FsObjectStore;
use scanguard::sync::LicenseSyncCoordinator;
use scanguard::util::SystemClock;

#[derive(Parser, Debug)]
#[command(name = "scanguard", version)]
#[command(about = "License enforcement and License Manager sync for scan jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the admission API and the sync scheduler
    Serve,
    /// Run one sync pass and exit
    Sync,
    /// Manage the tenant's client key
    ClientKey {
        #[command(subcommand)]
        action: ClientKeyAction,
    },
    /// Inspect or remove synchronized licenses
    License {
        #[command(subcommand)]
        action: LicenseAction,
    },
    /// Remove a customer and everything licensed to it
    DeleteCustomer { customer_id: String },
    /// Configure the License Manager endpoint
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },
    /// Print a new random master key
    GenerateMasterKey,
}

#[derive(Subcommand, Debug)]
enum ClientKeyAction {
    /// Register a client key, replacing the current one
    Add {
        #[arg(long)]
        key_id: String,
        #[arg(long)]
        algorithm: SigningAlgorithm,
        /// PEM file with the private key
        #[arg(long)]
        file: PathBuf,
        /// The file holds base64-encoded PEM
        #[arg(long = "base64")]
        b64_encoded: bool,
    },
    Describe {
        #[arg(long)]
        key_id: String,
    },
    Delete {
        #[arg(long)]
        key_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum LicenseAction {
    Describe { license_key: String },
    Delete { license_key: String },
}

#[derive(Subcommand, Debug)]
enum EndpointAction {
    Set {
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "HTTPS")]
        protocol: Protocol,
        #[arg(long)]
        stage: Option<String>,
    },
    Show,
    /// Drop the stored endpoint and fall back to LM_* variables
    Reset,
}

fn master_key(config: &Config) -> anyhow::Result<MasterKey> {
    let encoded = config
        .master_key
        .as_deref()
        .context("SCANGUARD_MASTER_KEY is not set (see `scanguard generate-master-key`)")?;
    Ok(MasterKey::from_base64(encoded)?)
}

fn build_issuer(config: &Config, pool: &DbPool) -> anyhow::Result<TokenIssuer> {
    match &config.key_custody {
        KeyCustody::Local => {
            let source = RegisteredClientKey::new(pool.clone(), master_key(config)?);
            // later deletions and rotations take effect per token
            source
                .current()
                .context("no usable client key registered (see `scanguard client-key add`)")?;
            Ok(TokenIssuer::Local(Arc::new(source)))
        }
        KeyCustody::Remote {
            endpoint,
            key_id,
            algorithm,
        } => {
            tracing::info!(endpoint = %endpoint, key_id = %key_id, "using remote key custody");
            Ok(TokenIssuer::Remote {
                kms: Arc::new(RemoteKms::new(endpoint, config.request_timeout)?),
                key_id: key_id.clone(),
                algorithm: *algorithm,
            })
        }
    }
}

fn build_state(config: &Config, pool: DbPool) -> anyhow::Result<AppState> {
    let clock = Arc::new(SystemClock);
    let endpoint = license_manager::resolve_endpoint(&*pool.get()?, &config.license_manager)?;
    tracing::info!(base_url = %endpoint.base_url(), "license manager endpoint");

    let api = Arc::new(HttpLicenseManager::new(&endpoint, config.request_timeout)?);
    let issuer = Arc::new(build_issuer(config, &pool)?);
    let objects = Arc::new(FsObjectStore::new(&config.object_store_path));

    let ledger = Arc::new(LicenseAllowanceLedger::new(
        pool.clone(),
        clock.clone(),
        config.ledger.clone(),
    ));
    let source = match config.admission_mode {
        AdmissionMode::Ledger => DecisionSource::Ledger,
        AdmissionMode::Authority => DecisionSource::Authority {
            api: api.clone(),
            issuer: issuer.clone(),
            tenant_id: config.sync.tenant_id.clone(),
            token_lifetime: config.sync.token_lifetime,
        },
    };
    let gate = Arc::new(JobAdmissionGate::new(ledger.clone(), source));
    let coordinator = Arc::new(LicenseSyncCoordinator::new(
        api,
        issuer,
        pool.clone(),
        objects,
        clock,
        config.sync.clone(),
    ));

    Ok(AppState {
        db: pool,
        ledger,
        gate,
        coordinator,
    })
}

async fn serve(config: Config, pool: DbPool) -> anyhow::Result<()> {
    let state = build_state(&config, pool.clone())?;

    let scheduler: Box<dyn JobScheduler> = match config.scheduler_mode {
        SchedulerMode::Interval => Box::new(IntervalScheduler::new(state.coordinator.clone())),
        SchedulerMode::EventRule => Box::new(EventRuleScheduler::new(
            pool,
            format!("scanguard-sync-{}", config.sync.tenant_id),
            format!("http://{}/sync", config.addr()),
        )),
    };
    scheduler.enable(config.sync.interval).await?;

    let app = handlers::router(state).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("failed to bind {}", config.addr()))?;
    tracing::info!(addr = %config.addr(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    scheduler.disable().await?;
    tracing::info!("shut down");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scanguard=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::GenerateMasterKey = cli.command {
        println!("{}", MasterKey::generate().to_base64());
        return Ok(());
    }

    let config = Config::from_env()?;
    let pool = db::create_pool(&config.database_path, 8)
        .with_context(|| format!("failed to open database {}", config.database_path))?;

    match cli.command {
        Command::Serve => serve(config, pool).await?,
        Command::Sync => {
            let state = build_state(&config, pool)?;
            match state.coordinator.run(None).await? {
                SyncOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    if !report.all_succeeded() {
                        bail!("sync finished with failed stages");
                    }
                }
                SyncOutcome::Skipped => println!("sync already running"),
            }
        }
        Command::ClientKey { action } => match action {
            ClientKeyAction::Add {
                key_id,
                algorithm,
                file,
                b64_encoded,
            } => {
                let private_key = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let input = CreateClientKey {
                    key_id,
                    algorithm,
                    private_key,
                    b64_encoded,
                };
                let info =
                    queries::create_client_key(&mut *pool.get()?, &input, &master_key(&config)?)?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            ClientKeyAction::Describe { key_id } => {
                let info = queries::get_client_key_info(&*pool.get()?, &key_id)?
                    .with_context(|| format!("client key {} not found", key_id))?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            ClientKeyAction::Delete { key_id } => {
                if !queries::delete_client_key(&*pool.get()?, &key_id)? {
                    bail!("client key {} not found", key_id);
                }
                println!("deleted client key {}", key_id);
            }
        },
        Command::License { action } => match action {
            LicenseAction::Describe { license_key } => {
                let license = queries::get_license(&*pool.get()?, &license_key)?
                    .with_context(|| format!("license {} not found", license_key))?;
                println!("{}", serde_json::to_string_pretty(&license)?);
            }
            LicenseAction::Delete { license_key } => {
                if !queries::delete_license(&*pool.get()?, &license_key)? {
                    bail!("license {} not found", license_key);
                }
                println!("deleted license {}", license_key);
            }
        },
        Command::DeleteCustomer { customer_id } => {
            let removal = queries::delete_customer(&mut *pool.get()?, &customer_id)?;
            println!("{}", serde_json::to_string_pretty(&removal)?);
        }
        Command::Endpoint { action } => match action {
            EndpointAction::Set {
                host,
                port,
                protocol,
                stage,
            } => {
                let endpoint = LicenseManagerEndpoint {
                    host,
                    port,
                    protocol,
                    stage,
                };
                license_manager::save_endpoint(&*pool.get()?, &endpoint)?;
                println!("{}", endpoint.base_url());
            }
            EndpointAction::Show => {
                let endpoint =
                    license_manager::resolve_endpoint(&*pool.get()?, &config.license_manager)?;
                println!("{}", serde_json::to_string_pretty(&endpoint)?);
            }
            EndpointAction::Reset => {
                if license_manager::clear_endpoint(&*pool.get()?)? {
                    println!("stored endpoint removed");
                }
            }
        },
        Command::GenerateMasterKey => {}
    }

    Ok(())
}
