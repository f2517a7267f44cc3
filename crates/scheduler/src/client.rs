//! Scheduler REST client.
//!
//! Generic surface: `POST /v1/jobs`, `DELETE /v1/job/{id}`,
//! `GET /v1/job/{id}`, `GET /v1/services`, `GET /v1/service/{name}`,
//! `GET /v1/allocations?resources=true`. Transport errors retry with
//! exponential backoff (base 500 ms, cap 8 s, max 5 attempts);
//! application errors never retry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mb_domain::error::{Error, Result};

use crate::jobspec::JobSpec;

pub const RETRY_BASE: Duration = Duration::from_millis(500);
pub const RETRY_CAP: Duration = Duration::from_secs(8);
pub const MAX_ATTEMPTS: u32 = 5;
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheduler's view of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    /// `pending`, `running`, or `dead`.
    pub status: String,
}

impl JobInfo {
    pub fn is_dead(&self) -> bool {
        self.status == "dead"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// One allocation with its resource usage, as returned by
/// `GET /v1/allocations?resources=true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub job_id: String,
    pub client_status: String,
    /// Task name → allocated CPU MHz.
    #[serde(default)]
    pub cpu_mhz: HashMap<String, u64>,
}

impl Allocation {
    pub fn is_running(&self) -> bool {
        self.client_status == "running"
    }

    pub fn total_cpu_mhz(&self) -> u64 {
        self.cpu_mhz.values().sum()
    }
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Submit a rendered job spec; returns the job id.
    async fn submit_job(&self, spec: &JobSpec) -> Result<String>;

    /// Idempotent delete.
    async fn delete_job(&self, job_id: &str) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>>;

    async fn job_exists(&self, job_id: &str) -> Result<bool> {
        Ok(self.get_job(job_id).await?.is_some())
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>>;

    async fn get_service_info(&self, service_name: &str) -> Result<Option<ServiceInfo>>;

    async fn list_allocations(&self) -> Result<Vec<Allocation>>;
}

/// Exponential backoff delay before retry number `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(10);
    RETRY_BASE.saturating_mul(1u32 << exp).min(RETRY_CAP)
}

/// Run `send` up to [`MAX_ATTEMPTS`] times, sleeping between transport
/// failures. Non-2xx responses are application errors and surface
/// immediately as `internal`; transport exhaustion surfaces as
/// `scheduler_unavailable`.
async fn retry<T, F, Fut>(op: &str, send: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, reqwest::Error>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        match send().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_status() => {
                return Err(Error::Internal(format!("scheduler {op}: {e}")));
            }
            Err(e) => {
                tracing::warn!(op, attempt, error = %e, "scheduler call failed, retrying");
                last_err = Some(e);
            }
        }
    }
    Err(Error::SchedulerUnavailable(format!(
        "{op} failed after {MAX_ATTEMPTS} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct HttpSchedulerClient {
    client: reqwest::Client,
    endpoint: String,
    task_runner_token: String,
}

impl HttpSchedulerClient {
    pub fn new(endpoint: impl Into<String>, task_runner_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            task_runner_token: task_runner_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn submit_job(&self, spec: &JobSpec) -> Result<String> {
        let this = self.clone();
        let url = self.url("/v1/jobs");
        let payload = spec.render();
        retry("submit_job", move || {
            let this = this.clone();
            let url = url.clone();
            let payload = payload.clone();
            async move {
                this.client
                    .post(url)
                    .header("X-Task-Runner-Token", &this.task_runner_token)
                    .timeout(CALL_TIMEOUT)
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
        })
        .await?;
        Ok(spec.name.clone())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let this = self.clone();
        let url = self.url(&format!("/v1/job/{job_id}"));
        retry("delete_job", move || {
            let this = this.clone();
            let url = url.clone();
            async move {
                let response = this
                    .client
                    .delete(url)
                    .header("X-Task-Runner-Token", &this.task_runner_token)
                    .timeout(CALL_TIMEOUT)
                    .send()
                    .await?;
                // Deleting a job the scheduler no longer knows is a success.
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(());
                }
                response.error_for_status()?;
                Ok(())
            }
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let this = self.clone();
        let url = self.url(&format!("/v1/job/{job_id}"));
        retry("get_job", move || {
            let this = this.clone();
            let url = url.clone();
            async move {
                let response = this
                    .client
                    .get(url)
                    .header("X-Task-Runner-Token", &this.task_runner_token)
                    .timeout(HEALTH_TIMEOUT)
                    .send()
                    .await?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let info = response.error_for_status()?.json::<JobInfo>().await?;
                Ok(Some(info))
            }
        })
        .await
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let this = self.clone();
        let url = self.url("/v1/services");
        retry("list_services", move || {
            let this = this.clone();
            let url = url.clone();
            async move {
                this.client
                    .get(url)
                    .header("X-Task-Runner-Token", &this.task_runner_token)
                    .timeout(CALL_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Vec<ServiceInfo>>()
                    .await
            }
        })
        .await
    }

    async fn get_service_info(&self, service_name: &str) -> Result<Option<ServiceInfo>> {
        let this = self.clone();
        let url = self.url(&format!("/v1/service/{service_name}"));
        retry("get_service_info", move || {
            let this = this.clone();
            let url = url.clone();
            async move {
                let response = this
                    .client
                    .get(url)
                    .header("X-Task-Runner-Token", &this.task_runner_token)
                    .timeout(CALL_TIMEOUT)
                    .send()
                    .await?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let info = response.error_for_status()?.json::<ServiceInfo>().await?;
                Ok(Some(info))
            }
        })
        .await
    }

    async fn list_allocations(&self) -> Result<Vec<Allocation>> {
        let this = self.clone();
        let url = self.url("/v1/allocations");
        retry("list_allocations", move || {
            let this = this.clone();
            let url = url.clone();
            async move {
                this.client
                    .get(url)
                    .query(&[("resources", "true")])
                    .header("X-Task-Runner-Token", &this.task_runner_token)
                    .timeout(CALL_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<Vec<Allocation>>()
                    .await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(9), RETRY_CAP);
    }

    #[test]
    fn allocation_cpu_sums_tasks() {
        let alloc = Allocation {
            job_id: "deployment-x".into(),
            client_status: "running".into(),
            cpu_mhz: [("server".to_string(), 600), ("sidecar".to_string(), 300)]
                .into_iter()
                .collect(),
        };
        assert!(alloc.is_running());
        assert_eq!(alloc.total_cpu_mhz(), 900);
    }

    #[tokio::test]
    async fn retry_gives_up_with_scheduler_unavailable() {
        // Nothing listens on this port; every attempt is a transport error.
        let client = HttpSchedulerClient::new("http://127.0.0.1:1", "token");
        let started = std::time::Instant::now();
        let err = client.get_job("train-x").await.unwrap_err();
        assert!(err.to_string().starts_with("scheduler_unavailable"));
        // Four backoff sleeps: 0.5 + 1 + 2 + 4 seconds.
        assert!(started.elapsed() >= Duration::from_millis(7_000));
    }
}
