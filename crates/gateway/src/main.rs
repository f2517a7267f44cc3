use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mb_domain::config::GatewayConfig;
use mb_gateway::api;
use mb_gateway::cli::{Cli, Command};
use mb_gateway::jobs::JobManager;
use mb_gateway::state::AppState;
use mb_identity::mailer::{LogMailer, Mailer, SendGridMailer};
use mb_identity::{PermissionResolver, TokenSigner};
use mb_metadata::MetadataStore;
use mb_scheduler::{HttpSchedulerClient, LicenseGate, Reconciler, SchedulerClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Arc::new(GatewayConfig::from_env().context("loading gateway config")?);
            run_server(config).await
        }
        Some(Command::Backup { config }) => {
            run_cli(mb_gateway::cli::run_backup_command(config).await)
        }
        Some(Command::Restore { archive }) => {
            run_cli(mb_gateway::cli::run_restore_command(&archive))
        }
        Some(Command::Users { command }) => run_cli(mb_gateway::cli::run_users_command(command)),
        Some(Command::Models { command }) => run_cli(mb_gateway::cli::run_models_command(command)),
        Some(Command::Version) => {
            println!("model-bazaar {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_cli(result: mb_domain::Result<()>) -> anyhow::Result<()> {
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mb_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the control plane with the given configuration.
async fn run_server(config: Arc<GatewayConfig>) -> anyhow::Result<()> {
    tracing::info!("Model Bazaar starting");

    // ── Metadata store ───────────────────────────────────────────────
    let store = Arc::new(
        MetadataStore::open(&config.database_uri).context("opening metadata store")?,
    );
    tracing::info!(models = store.list_models().len(), "metadata store ready");

    // ── License gate (verified once up front so a bad file fails fast) ──
    let license = Arc::new(LicenseGate::new(&config.license_path).context("license gate")?);
    let info = license.verify().context("verifying license")?;
    tracing::info!(
        cpu_mhz_limit = %info.cpu_mhz_limit,
        expiry = %info.expiry_date,
        "license verified"
    );

    // ── Identity ─────────────────────────────────────────────────────
    let mailer: Arc<dyn Mailer> = match &config.sendgrid_key {
        Some(key) => Arc::new(SendGridMailer::new(
            key.clone(),
            format!("no-reply@{}", config.model_bazaar_endpoint),
        )),
        None => Arc::new(LogMailer),
    };
    let identity = mb_identity::backend::from_config(&config, store.clone(), mailer)
        .context("initializing identity backend")?;
    tracing::info!(backend = identity.backend_name(), "identity backend ready");

    let signer = TokenSigner::new(&config.jwt_secret);
    let permissions = Arc::new(PermissionResolver::new(store.clone()));
    tracing::info!("permission resolver ready");

    // ── Scheduler + jobs ─────────────────────────────────────────────
    let scheduler: Arc<dyn SchedulerClient> = Arc::new(HttpSchedulerClient::new(
        &config.nomad_endpoint,
        &config.task_runner_token,
    ));
    let jobs = Arc::new(JobManager::new(&config, scheduler.clone(), license.clone()));
    tracing::info!(endpoint = %config.nomad_endpoint, "scheduler client ready");

    // ── Status reconciler ────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let reconciler = Reconciler::new(
            store.clone(),
            scheduler.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        );
        tokio::spawn(reconciler.run(cancel.clone()));
    }
    tracing::info!(
        interval_secs = config.reconcile_interval_secs,
        "status reconciler running"
    );

    // ── Scheduled backups ────────────────────────────────────────────
    tokio::spawn(mb_gateway::backup::run_interval(
        config.model_bazaar_dir.clone(),
        cancel.clone(),
    ));

    // ── App state ────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        store,
        identity,
        signer,
        permissions,
        scheduler,
        license,
        jobs,
        http: reqwest::Client::new(),
    };

    // ── Rate-limit layer (per-IP token bucket via governor) ─────────
    let governor_layer = config.rate_limit_per_second.map(|per_second| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(per_second)
            .burst_size(per_second.max(1) as u32 * 2)
            .finish()
            .expect("rate limit must be > 0");
        tracing::info!(per_second, "per-IP rate limiting enabled");
        GovernorLayer {
            config: Arc::new(gov_config),
        }
    });

    // ── Router ───────────────────────────────────────────────────────
    let router = api::router(state.clone())
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));
    let app = if let Some(governor) = governor_layer {
        router.layer(governor).with_state(state)
    } else {
        router.with_state(state)
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Model Bazaar listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}
