use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mb_domain::config::WorkerConfig;
use mb_domain::model::{ModelType, Status};
use mb_scheduler::{HttpSchedulerClient, SchedulerClient};
use mb_worker::api;
use mb_worker::idle::IdleWatchdog;
use mb_worker::kernel::{ClassifierKernel, ModelKernel, RetrieverKernel, RuleClassifier, TokenClassifier};
use mb_worker::reporter::{HttpReporter, Reporter};
use mb_worker::state::{KernelHandle, WorkerState};
use mb_worker::telemetry::TelemetryWriter;
use mb_worker::update_log::UpdateLogger;
use mb_worker::writer::{watch_marker, PendingUpdates, ReplayPipeline, WriterLock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mb_worker=debug")),
        )
        .json()
        .init();

    let config = Arc::new(WorkerConfig::from_env().context("loading worker config")?);
    let reporter = HttpReporter::new(&config.model_bazaar_endpoint, &config.job_token);

    match run(config.clone(), &reporter).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            // Errors crossing the job boundary land in the metadata
            // store even when this process dies.
            if let Err(report_err) = reporter
                .update_deploy_status(config.model_id, Status::Failed)
                .await
            {
                tracing::error!(error = %report_err, "could not report failure");
            }
            std::process::exit(1);
        }
    }
}

async fn run(config: Arc<WorkerConfig>, reporter: &HttpReporter) -> anyhow::Result<()> {
    tracing::info!(model_id = %config.model_id, model_type = ?config.model_type, "worker starting");
    let artifact = config.artifact_path();
    let deployment_dir = config.deployment_dir();

    // ── Writer election ──────────────────────────────────────────────
    let writer_lock = WriterLock::try_acquire(&artifact).context("writer election")?;
    let is_writer = writer_lock.is_some();
    tracing::info!(is_writer, "writer election settled");

    // ── Model kernel ─────────────────────────────────────────────────
    let kernel: Arc<dyn ModelKernel> = match config.model_type {
        ModelType::Ndb => Arc::new(
            RetrieverKernel::load(&artifact).context("loading retrieval artifact")?,
        ),
        ModelType::Udt => Arc::new(
            ClassifierKernel::load(&artifact).context("loading classifier artifact")?,
        ),
        other => anyhow::bail!("model type {other:?} is not deployable"),
    };
    let kernel = Arc::new(KernelHandle::new(kernel));
    tracing::info!("model artifact loaded");

    // ── Guardrail composition ────────────────────────────────────────
    let guardrail: Option<Arc<dyn TokenClassifier>> = match config.guardrail_id {
        Some(guardrail_id) => {
            let guardrail_artifact = config
                .model_bazaar_dir
                .join("models")
                .join(guardrail_id.to_string());
            let classifier =
                RuleClassifier::load(&guardrail_artifact).context("loading guardrail")?;
            tracing::info!(guardrail_id = %guardrail_id, "guardrail ready");
            Some(Arc::new(classifier))
        }
        None => None,
    };

    // ── Update logs + telemetry ──────────────────────────────────────
    let update_log = Arc::new(UpdateLogger::open(&deployment_dir).context("opening update logs")?);
    tracing::info!(replica_id = %update_log.replica_id(), "update logs ready");
    let telemetry = Arc::new(TelemetryWriter::open(
        &deployment_dir,
        config.telemetry_sample_rate,
    ));

    // ── Scheduler client + auto-idle watchdog ────────────────────────
    let scheduler: Arc<dyn SchedulerClient> = Arc::new(HttpSchedulerClient::new(
        &config.nomad_endpoint,
        &config.task_runner_token,
    ));
    let idle = Arc::new(IdleWatchdog::new(Duration::from_secs(
        config.idle_shutdown_secs,
    )));
    let cancel = CancellationToken::new();
    {
        let job_name = format!("deployment-{}", config.model_id);
        tokio::spawn(idle.clone().run(scheduler.clone(), job_name, cancel.clone()));
    }
    tracing::info!(idle_secs = config.idle_shutdown_secs, "auto-idle watchdog running");

    // ── Writer pipeline / replica reload watcher ─────────────────────
    let pending = Arc::new(PendingUpdates::default());
    if is_writer {
        let pipeline = Arc::new(
            ReplayPipeline::new(
                kernel.get(),
                artifact.clone(),
                deployment_dir.clone(),
                Duration::from_secs(config.writer_save_interval_secs),
                config.writer_save_batch_size,
                pending.clone(),
            )
            .context("starting replay pipeline")?,
        );
        tokio::spawn(pipeline.run(cancel.clone()));
        tracing::info!("replay pipeline running (writer)");
    } else {
        let kernel_for_reload = kernel.clone();
        let artifact_for_reload = artifact.clone();
        tokio::spawn(watch_marker(
            artifact.clone(),
            Duration::from_secs(5),
            cancel.clone(),
            move || match RetrieverKernel::load(&artifact_for_reload) {
                Ok(fresh) => kernel_for_reload.replace(Arc::new(fresh)),
                Err(e) => tracing::error!(error = %e, "snapshot reload failed"),
            },
        ));
        tracing::info!("snapshot watcher running (read replica)");
    }

    // ── Answer generation provider ───────────────────────────────────
    let llm: Option<Arc<dyn mb_llm::LlmProvider>> = match &config.llm_base_url {
        Some(base_url) => {
            let provider = mb_llm::openai_compat::OpenAiCompatProvider::new(
                "deployment-llm",
                base_url.clone(),
                config.llm_api_key.clone(),
                config.llm_model.clone(),
            )
            .context("initializing llm provider")?;
            tracing::info!(base_url = %base_url, "answer generation enabled");
            Some(Arc::new(provider))
        }
        None => None,
    };

    // ── State + router ───────────────────────────────────────────────
    let state = WorkerState {
        config: config.clone(),
        kernel,
        guardrail,
        update_log,
        telemetry,
        idle,
        pending,
        llm,
        job_token_hash: Arc::new(Sha256::digest(config.job_token.as_bytes()).to_vec()),
        is_writer,
    };
    let app = api::router(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    // ── Bind, then report ready ──────────────────────────────────────
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "worker listening");

    reporter
        .update_deploy_status(config.model_id, Status::Complete)
        .await
        .context("reporting deploy status")?;

    axum::serve(listener, app).await.context("axum server error")?;

    // Keep the writer lock alive for the whole process lifetime.
    drop(writer_lock);
    Ok(())
}
