//! Typed job specs and their rendered scheduler payloads.
//!
//! Every job the control plane submits — training, deployment, the
//! cache singleton, backups — is described by one [`JobSpec`] rendered
//! into the scheduler's JSON document. The rendered spec is also written
//! to `{MODEL_BAZAAR_DIR}/jobs/{name}.json` before submission so the
//! exact submitted payload is inspectable after the fact.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mb_domain::error::Result;

/// Default CPU requests per job kind, in MHz.
pub const TRAIN_CPU_MHZ: u64 = 2000;
pub const DEPLOY_CPU_MHZ: u64 = 1000;
pub const CACHE_CPU_MHZ: u64 = 500;
pub const BACKUP_CPU_MHZ: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job id on the scheduler (also the job name).
    pub name: String,
    /// Container image, tagged.
    pub image: String,
    /// Environment injected into the task.
    pub env: BTreeMap<String, String>,
    pub cpu_mhz: u64,
    /// Replica count (deployments may run several read replicas).
    pub count: u32,
    /// Whether the scheduler should restart the task when it exits
    /// (services yes, batch jobs no).
    pub service: bool,
}

impl JobSpec {
    /// The scheduler payload for `POST /v1/jobs`.
    pub fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.name,
            "name": self.name,
            "type": if self.service { "service" } else { "batch" },
            "task_groups": [{
                "name": self.name,
                "count": self.count,
                "tasks": [{
                    "name": "main",
                    "driver": "docker",
                    "config": { "image": self.image },
                    "env": self.env,
                    "resources": { "cpu_mhz": self.cpu_mhz },
                }],
            }],
        })
    }

    /// Write the rendered payload under `jobs_dir` before submission.
    pub fn persist(&self, jobs_dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(jobs_dir)?;
        let path = jobs_dir.join(format!("{}.json", self.name));
        let bytes = serde_json::to_vec_pretty(&self.render())?;
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// Common environment every job gets.
fn base_env(
    model_bazaar_dir: &Path,
    model_bazaar_endpoint: &str,
    task_runner_token: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "MODEL_BAZAAR_DIR".to_string(),
            model_bazaar_dir.display().to_string(),
        ),
        (
            "MODEL_BAZAAR_ENDPOINT".to_string(),
            model_bazaar_endpoint.to_string(),
        ),
        ("TASK_RUNNER_TOKEN".to_string(), task_runner_token.to_string()),
    ])
}

/// Builder bundle shared by the gateway when rendering job specs.
pub struct JobSpecBuilder {
    pub model_bazaar_dir: std::path::PathBuf,
    pub model_bazaar_endpoint: String,
    pub task_runner_token: String,
    pub nomad_endpoint: String,
    pub image_tag: String,
}

impl JobSpecBuilder {
    fn env_for_model(&self, model_id: Uuid, model_type: &str, job_token: &str) -> BTreeMap<String, String> {
        let mut env = base_env(
            &self.model_bazaar_dir,
            &self.model_bazaar_endpoint,
            &self.task_runner_token,
        );
        env.insert("MODEL_ID".to_string(), model_id.to_string());
        env.insert("MODEL_TYPE".to_string(), model_type.to_string());
        env.insert("JOB_TOKEN".to_string(), job_token.to_string());
        env.insert("NOMAD_ENDPOINT".to_string(), self.nomad_endpoint.clone());
        env
    }

    pub fn train_job(
        &self,
        model_id: Uuid,
        model_type: &str,
        job_token: &str,
        data_refs: &[String],
        base_model_id: Option<Uuid>,
    ) -> JobSpec {
        let mut env = self.env_for_model(model_id, model_type, job_token);
        env.insert("TRAIN_DATA".to_string(), data_refs.join(","));
        if let Some(base) = base_model_id {
            env.insert("BASE_MODEL_ID".to_string(), base.to_string());
        }
        JobSpec {
            name: format!("train-{model_id}"),
            image: format!("model-bazaar-train:{}", self.image_tag),
            env,
            cpu_mhz: TRAIN_CPU_MHZ,
            count: 1,
            service: false,
        }
    }

    pub fn deploy_job(
        &self,
        model_id: Uuid,
        model_type: &str,
        job_token: &str,
        guardrail_id: Option<Uuid>,
        replicas: u32,
    ) -> JobSpec {
        let mut env = self.env_for_model(model_id, model_type, job_token);
        if let Some(guardrail) = guardrail_id {
            env.insert("GUARDRAIL_ID".to_string(), guardrail.to_string());
        }
        JobSpec {
            name: format!("deployment-{model_id}"),
            image: format!("model-bazaar-worker:{}", self.image_tag),
            env,
            cpu_mhz: DEPLOY_CPU_MHZ,
            count: replicas.max(1),
            service: true,
        }
    }

    pub fn cache_job(&self, jwt_secret: &str, threshold: f64) -> JobSpec {
        let mut env = base_env(
            &self.model_bazaar_dir,
            &self.model_bazaar_endpoint,
            &self.task_runner_token,
        );
        env.insert("JWT_SECRET".to_string(), jwt_secret.to_string());
        env.insert("LLM_CACHE_THRESHOLD".to_string(), threshold.to_string());
        JobSpec {
            name: "llm-cache".to_string(),
            image: format!("model-bazaar-cache:{}", self.image_tag),
            env,
            cpu_mhz: CACHE_CPU_MHZ,
            count: 1,
            service: true,
        }
    }

    pub fn backup_job(&self) -> JobSpec {
        JobSpec {
            name: "backup".to_string(),
            image: format!("model-bazaar-backup:{}", self.image_tag),
            env: base_env(
                &self.model_bazaar_dir,
                &self.model_bazaar_endpoint,
                &self.task_runner_token,
            ),
            cpu_mhz: BACKUP_CPU_MHZ,
            count: 1,
            service: false,
        }
    }
}
