//! Job submission plumbing shared by the train/deploy/backup handlers.
//!
//! One place owns the order of operations for every submission: license
//! admission, spec rendering, persisting the rendered spec under
//! `{MODEL_BAZAAR_DIR}/jobs`, then the actual submit.

use std::path::PathBuf;
use std::sync::Arc;

use mb_domain::config::GatewayConfig;
use mb_domain::error::Result;
use mb_scheduler::jobspec::JobSpecBuilder;
use mb_scheduler::{JobSpec, LicenseGate, SchedulerClient};

pub struct JobManager {
    scheduler: Arc<dyn SchedulerClient>,
    license: Arc<LicenseGate>,
    builder: JobSpecBuilder,
    jobs_dir: PathBuf,
}

impl JobManager {
    pub fn new(
        config: &GatewayConfig,
        scheduler: Arc<dyn SchedulerClient>,
        license: Arc<LicenseGate>,
    ) -> Self {
        let builder = JobSpecBuilder {
            model_bazaar_dir: config.model_bazaar_dir.clone(),
            model_bazaar_endpoint: config.model_bazaar_endpoint.clone(),
            task_runner_token: config.task_runner_token.clone(),
            nomad_endpoint: config.nomad_endpoint.clone(),
            image_tag: std::env::var("TAG").unwrap_or_else(|_| "latest".to_string()),
        };
        Self {
            scheduler,
            license: license.clone(),
            builder,
            jobs_dir: config.model_bazaar_dir.join("jobs"),
        }
    }

    pub fn builder(&self) -> &JobSpecBuilder {
        &self.builder
    }

    /// License-gate, persist, and submit one job spec.
    pub async fn submit(&self, spec: JobSpec) -> Result<String> {
        self.license.admit(self.scheduler.as_ref(), spec.cpu_mhz).await?;
        spec.persist(&self.jobs_dir)?;
        let job_id = self.scheduler.submit_job(&spec).await?;
        tracing::info!(job = %job_id, cpu_mhz = spec.cpu_mhz, "job submitted");
        Ok(job_id)
    }

    pub async fn delete(&self, job_id: &str) -> Result<()> {
        self.scheduler.delete_job(job_id).await
    }
}
