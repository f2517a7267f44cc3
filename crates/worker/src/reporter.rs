//! Status reporting back to the control plane.

use async_trait::async_trait;
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_domain::model::Status;

/// One interface, one HTTP implementation, one no-op for tests.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn update_deploy_status(&self, model_id: Uuid, status: Status) -> Result<()>;
}

/// Posts to the control plane's `POST /api/deploy/update-status`,
/// authenticated with the job token.
pub struct HttpReporter {
    client: reqwest::Client,
    endpoint: String,
    job_token: String,
}

impl HttpReporter {
    pub fn new(endpoint: impl Into<String>, job_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            job_token: job_token.into(),
        }
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn update_deploy_status(&self, model_id: Uuid, status: Status) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/deploy/update-status", self.endpoint))
            .bearer_auth(&self.job_token)
            .json(&serde_json::json!({
                "model_id": model_id,
                "status": status,
            }))
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("status report: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "status report rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Records reported statuses instead of sending them.
#[derive(Default)]
pub struct NoopReporter {
    pub reported: parking_lot::Mutex<Vec<(Uuid, Status)>>,
}

#[async_trait]
impl Reporter for NoopReporter {
    async fn update_deploy_status(&self, model_id: Uuid, status: Status) -> Result<()> {
        self.reported.lock().push((model_id, status));
        Ok(())
    }
}
