//! Status reconciler — keeps Model rows consistent with what the
//! scheduler actually runs.
//!
//! One periodic task. Every tick it scans models in non-terminal
//! statuses, fetches the scheduler's view of their jobs, and applies the
//! legal transition rules: a job that should be running but is dead or
//! unknown demotes `starting`/`in_progress` to `failed`, and a deployed
//! model whose job died demotes `complete` to `stopped`. Demotions are
//! logged at warn and the human-readable reason lands on the row.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mb_domain::error::Result;
use mb_domain::model::Status;
use mb_metadata::store::StatusKind;
use mb_metadata::{MetadataStore, Model};

use crate::client::SchedulerClient;

pub struct Reconciler {
    store: Arc<MetadataStore>,
    scheduler: Arc<dyn SchedulerClient>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<MetadataStore>,
        scheduler: Arc<dyn SchedulerClient>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            interval,
        }
    }

    /// Run until cancelled. Tick failures are logged and do not stop the
    /// loop.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "reconcile tick failed");
                    }
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn tick(&self) -> Result<()> {
        for model in self.store.list_models() {
            if let Err(e) = self.reconcile_model(&model).await {
                tracing::warn!(model_id = %model.id, error = %e, "failed to reconcile model");
            }
        }
        self.record_cpu_usage().await;
        Ok(())
    }

    async fn reconcile_model(&self, model: &Model) -> Result<()> {
        // Workflows never have jobs of their own.
        if model.model_type.is_workflow() {
            return Ok(());
        }

        if matches!(model.train_status, Status::Starting | Status::InProgress) {
            let job = self.scheduler.get_job(&model.train_job_name()).await?;
            if job.as_ref().map_or(true, |j| j.is_dead()) {
                tracing::warn!(
                    model_id = %model.id,
                    status = %model.train_status,
                    "train job is dead or missing, marking failed"
                );
                self.store.transition(
                    model.id,
                    StatusKind::Train,
                    Status::Failed,
                    Some("training job was not observed running on the scheduler".to_string()),
                )?;
            }
        }

        let deploy_name = model.deploy_job_name();
        match model.deploy_status {
            Status::Starting | Status::InProgress => {
                let job = self.scheduler.get_job(&deploy_name).await?;
                if job.as_ref().map_or(true, |j| j.is_dead()) {
                    tracing::warn!(
                        model_id = %model.id,
                        status = %model.deploy_status,
                        "deployment job is dead or missing, marking failed"
                    );
                    self.store.transition(
                        model.id,
                        StatusKind::Deploy,
                        Status::Failed,
                        Some("deployment job was not observed running on the scheduler".to_string()),
                    )?;
                }
            }
            Status::Complete => {
                let job = self.scheduler.get_job(&deploy_name).await?;
                if job.as_ref().map_or(true, |j| j.is_dead()) {
                    tracing::warn!(
                        model_id = %model.id,
                        "deployment was complete but the job is dead or missing, marking stopped"
                    );
                    self.store.transition(
                        model.id,
                        StatusKind::Deploy,
                        Status::Stopped,
                        Some("deployment job disappeared from the scheduler".to_string()),
                    )?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Charge running allocations to their models' usage counters:
    /// `cpu_mhz / 1000 × interval` CPU-seconds per tick.
    async fn record_cpu_usage(&self) {
        let allocations = match self.scheduler.list_allocations().await {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(error = %e, "skipping usage accounting this tick");
                return;
            }
        };
        for model in self.store.list_models() {
            let mhz: u64 = allocations
                .iter()
                .filter(|a| {
                    a.is_running()
                        && (a.job_id == model.train_job_name()
                            || a.job_id == model.deploy_job_name())
                })
                .map(|a| a.total_cpu_mhz())
                .sum();
            if mhz > 0 {
                let cpu_seconds = mhz as f64 / 1000.0 * self.interval.as_secs_f64();
                if let Err(e) = self.store.record_usage(model.id, 0, 0, cpu_seconds) {
                    tracing::warn!(model_id = %model.id, error = %e, "usage accounting failed");
                }
            }
        }
    }
}
