//! Row types of the metadata schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mb_domain::model::{
    AccessLevel, IntegrationType, ModelSubType, ModelType, Status, TeamRole,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// Unique when set; OIDC-provisioned users may lack one initially.
    pub email: Option<String>,
    pub global_admin: bool,
    /// Organization domain, matched against protected models.
    pub domain: String,
    /// PHC-format PBKDF2 hash (salt embedded). `None` for OIDC users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTeam {
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub role: TeamRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Owning team, when the model belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub sub_type: ModelSubType,
    pub domain: String,
    pub access_level: AccessLevel,
    /// Derived-model DAG edge (fine-tuned copies, saved deployments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub train_status: Status,
    pub deploy_status: Status,
    pub cache_refresh_status: Status,
    /// Human-readable reason for the last forced status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Soft-delete marker; deleted rows are retained but hidden.
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Scheduler job names derived from the model id.
    pub fn train_job_name(&self) -> String {
        format!("train-{}", self.id)
    }

    pub fn deploy_job_name(&self) -> String {
        format!("deployment-{}", self.id)
    }
}

/// Workflow composition edge: `model_id` depends on `dependency_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDependency {
    pub model_id: Uuid,
    pub dependency_id: Uuid,
}

/// Free-form per-workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAttribute {
    pub model_id: Uuid,
    pub key: String,
    pub value: String,
}

/// A generated dataset registered in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub name: String,
    pub task: String,
    pub target_labels: Vec<String>,
    pub num_generated_samples: u64,
}

/// Per-model usage counters maintained by the job lifecycle manager and
/// the API layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub requests: u64,
    pub bytes_stored: u64,
    pub cpu_seconds: f64,
}

/// An external LLM endpoint usable by the cache job and deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    pub data: IntegrationData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}
