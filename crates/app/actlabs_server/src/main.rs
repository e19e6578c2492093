//! Actlabs managed server binary.
//!
//! Wires the Azure collaborators, the token verifier and the rate limiter into
//! the HTTP API and serves it until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use actlabs_api::config::ApiConfig;
use actlabs_core::auth::JwtVerifier;
use actlabs_core::azure::{
    ArmClient, ArmIdentityProvisioner, ArmOwnershipChecker, ArmWorkloadDeployer,
    ClientSecretCredential, KeyVaultSecretStore, ManagedIdentityCredential, TableActivityStore,
    TokenCredential,
};
use actlabs_core::cloud::SecretStore;
use actlabs_core::config::{AzureAuth, SecretStoreKind, ServiceConfig};
use actlabs_core::orchestrator::{Collaborators, LifecycleOrchestrator};
use actlabs_core::rate_limit::{MemoryRateLimiter, PgRateLimiter, RateLimiter};
use actlabs_core::readiness::{HttpReadinessProbe, ReadinessPoller};
use actlabs_core::secrets::EnvSecretStore;

/// CLI arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "actlabs_server", about = "Actlabs managed server control plane")]
struct Args {
    /// Port to listen on. Ignored when `BIND_ADDR` is set.
    #[arg(long, env = "PORT", default_value_t = 8883)]
    port: u16,

    /// PostgreSQL connection URL. When set, bad-request counters are shared
    /// through the database instead of kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,
}

/// How often closed rate-limit windows are swept from the database.
const COUNTER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

fn credential(config: &ServiceConfig, http: &reqwest::Client) -> Arc<dyn TokenCredential> {
    match &config.azure_auth {
        AzureAuth::ManagedIdentity { client_id } => {
            info!(client_id = ?client_id, "using managed identity credential");
            Arc::new(ManagedIdentityCredential::new(http.clone(), client_id.clone()))
        }
        AzureAuth::ClientSecret {
            client_id,
            client_secret,
        } => Arc::new(ClientSecretCredential::new(
            http.clone(),
            &config.tenant_id,
            client_id,
            client_secret,
        )),
    }
}

async fn rate_limiter(
    args: &Args,
) -> Result<Arc<dyn RateLimiter>, Box<dyn std::error::Error>> {
    let Some(database_url) = args.database_url.as_deref() else {
        info!("using in-memory rate limiter");
        let limiter = Arc::new(MemoryRateLimiter::new());
        limiter.spawn_cleanup_task();
        return Ok(limiter);
    };

    info!(max_connections = args.max_connections, "using PostgreSQL rate limiter");
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    info!("running database migrations");
    actlabs_api::migrate(&pool).await?;

    let limiter = PgRateLimiter::new(pool);
    tokio::spawn({
        let limiter = limiter.clone();
        async move {
            let mut interval = tokio::time::interval(COUNTER_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = limiter.cleanup().await {
                    error!(error = %e, "rate limit cleanup failed");
                }
            }
        }
    });
    Ok(Arc::new(limiter))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,actlabs_api=debug,actlabs_core=debug")
            }),
        )
        .init();

    let args = Args::parse();

    let config = ServiceConfig::from_env()?;
    config.log_summary();

    let mut api_config = ApiConfig::from_env();
    if std::env::var("BIND_ADDR").is_err() {
        api_config.bind_addr = format!("0.0.0.0:{}", args.port);
    }
    info!(
        bind_addr = %api_config.bind_addr,
        allowed_origins = ?api_config.allowed_origins,
        trust_forwarded_for = api_config.trust_forwarded_for,
        "api configuration"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let credential = credential(&config, &http);
    let arm = ArmClient::new(http.clone(), credential.clone());

    let secrets: Arc<dyn SecretStore> = match (config.secret_store, &config.key_vault_name) {
        (SecretStoreKind::KeyVault, Some(vault)) => Arc::new(KeyVaultSecretStore::new(
            http.clone(),
            credential.clone(),
            vault,
        )),
        _ => Arc::new(EnvSecretStore),
    };

    let collaborators = Collaborators {
        ownership: Arc::new(ArmOwnershipChecker::new(
            arm.clone(),
            config.required_role_definition.clone(),
        )),
        identities: Arc::new(ArmIdentityProvisioner::new(arm.clone())),
        workloads: Arc::new(ArmWorkloadDeployer::new(arm)),
        activity: Arc::new(TableActivityStore::new(
            http.clone(),
            credential,
            &config.storage_account,
            &config.server_table_name,
        )?),
        secrets,
    };
    let readiness = ReadinessPoller::with_wait_budget(
        Arc::new(HttpReadinessProbe::new(http.clone())),
        config.server_up_wait,
    );
    let orchestrator =
        LifecycleOrchestrator::new(collaborators, readiness, config.orchestrator_settings());

    let shutdown = CancellationToken::new();
    let state = actlabs_api::AppState {
        orchestrator: Arc::new(orchestrator),
        verifier: Arc::new(JwtVerifier::with_jwks(
            http,
            &config.auth_token_iss,
            &config.auth_token_aud,
        )),
        rate_limiter: rate_limiter(&args).await?,
        config: api_config.clone(),
        shutdown: shutdown.clone(),
    };

    let app = actlabs_api::router(state);
    let listener = tokio::net::TcpListener::bind(&api_config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutting down");
        shutdown.cancel();
    })
    .await?;

    Ok(())
}
