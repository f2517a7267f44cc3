//! Per-component configuration records, loaded from environment variables.
//!
//! Every component enumerates the variables it understands in one record
//! with an explicit `from_env()`. Missing required variables and
//! unparseable values fail startup; unrecognized `MB_`-prefixed variables
//! are rejected rather than silently ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env reader
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tracks which environment variables a config record consumed so that
/// unknown component-scoped (`MB_*`) variables can be rejected at startup.
pub struct EnvReader {
    seen: BTreeSet<String>,
}

impl EnvReader {
    pub fn new() -> Self {
        Self { seen: BTreeSet::new() }
    }

    pub fn required(&mut self, key: &str) -> Result<String> {
        self.seen.insert(key.to_string());
        match std::env::var(key) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => Err(Error::InvalidArgument(format!(
                "missing required environment variable {key}"
            ))),
        }
    }

    pub fn optional(&mut self, key: &str) -> Option<String> {
        self.seen.insert(key.to_string());
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }

    pub fn parsed<T: std::str::FromStr>(&mut self, key: &str, default: T) -> Result<T> {
        match self.optional(key) {
            Some(raw) => raw.parse::<T>().map_err(|_| {
                Error::InvalidArgument(format!("environment variable {key} has invalid value {raw:?}"))
            }),
            None => Ok(default),
        }
    }

    /// Fail if any `MB_`-prefixed variable is set that no record consumed.
    /// Typos in tuning knobs surface at startup instead of being ignored.
    pub fn reject_unknown(&self) -> Result<()> {
        let unknown: Vec<String> = std::env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with("MB_") && !self.seen.contains(k))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "unrecognized environment variables: {}",
                unknown.join(", ")
            )))
        }
    }
}

impl Default for EnvReader {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway (control plane)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// URI of the metadata store. `file:` URIs select the embedded store.
    pub database_uri: String,
    /// HS256 signing secret for access and cache-scope tokens.
    pub jwt_secret: String,
    /// Root of the shared artifact filesystem.
    pub model_bazaar_dir: PathBuf,
    /// Public URL of this control plane, baked into job specs.
    pub model_bazaar_endpoint: String,
    /// Path of the signed license file.
    pub license_path: PathBuf,
    /// Secret presented by scheduler-launched jobs.
    pub task_runner_token: String,
    /// Base URL of the external cluster scheduler.
    pub nomad_endpoint: String,
    /// Identity backend: `password` or `oidc`.
    pub identity_provider: String,
    /// OIDC issuer base URL (required when `identity_provider = oidc`).
    pub oidc_issuer: Option<String>,
    pub oidc_client_id: Option<String>,
    pub oidc_client_secret: Option<String>,
    /// SendGrid API key for password-reset mail. Absent = log-only mailer.
    pub sendgrid_key: Option<String>,
    pub host: String,
    pub port: u16,
    /// Global request timeout enforced by middleware.
    pub request_timeout_secs: u64,
    /// Reconciliation interval for the job lifecycle manager.
    pub reconcile_interval_secs: u64,
    /// Mutating endpoints refuse when free space drops below this fraction.
    pub min_free_disk_ratio: f64,
    /// Per-IP rate limit; `None` disables the governor layer.
    pub rate_limit_per_second: Option<u64>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let mut env = EnvReader::new();
        let cfg = Self {
            database_uri: env.required("DATABASE_URI")?,
            jwt_secret: env.required("JWT_SECRET")?,
            model_bazaar_dir: PathBuf::from(env.required("MODEL_BAZAAR_DIR")?),
            model_bazaar_endpoint: env.required("MODEL_BAZAAR_ENDPOINT")?,
            license_path: PathBuf::from(env.required("LICENSE_PATH")?),
            task_runner_token: env.required("TASK_RUNNER_TOKEN")?,
            nomad_endpoint: env.required("NOMAD_ENDPOINT")?,
            identity_provider: env
                .optional("IDENTITY_PROVIDER")
                .unwrap_or_else(|| "password".to_string()),
            oidc_issuer: env.optional("OIDC_ISSUER"),
            oidc_client_id: env.optional("OIDC_CLIENT_ID"),
            oidc_client_secret: env.optional("OIDC_CLIENT_SECRET"),
            sendgrid_key: env.optional("SENDGRID_KEY"),
            host: env.optional("MB_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.parsed("MB_PORT", 8000u16)?,
            request_timeout_secs: env.parsed("MB_REQUEST_TIMEOUT_SECS", 120u64)?,
            reconcile_interval_secs: env.parsed("MB_RECONCILE_INTERVAL_SECS", 5u64)?,
            min_free_disk_ratio: env.parsed("MB_MIN_FREE_DISK_RATIO", 0.2f64)?,
            rate_limit_per_second: match env.optional("MB_RATE_LIMIT_PER_SECOND") {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    Error::InvalidArgument(format!(
                        "environment variable MB_RATE_LIMIT_PER_SECOND has invalid value {raw:?}"
                    ))
                })?),
                None => None,
            },
        };
        env.reject_unknown()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        match self.identity_provider.as_str() {
            "password" => {}
            "oidc" => {
                if self.oidc_issuer.is_none() || self.oidc_client_id.is_none() {
                    return Err(Error::InvalidArgument(
                        "identity_provider=oidc requires OIDC_ISSUER and OIDC_CLIENT_ID".into(),
                    ));
                }
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "IDENTITY_PROVIDER must be 'password' or 'oidc', got {other:?}"
                )))
            }
        }
        if !(0.0..1.0).contains(&self.min_free_disk_ratio) {
            return Err(Error::InvalidArgument(
                "MB_MIN_FREE_DISK_RATIO must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding model artifacts: `{MODEL_BAZAAR_DIR}/models/{id}`.
    pub fn model_dir(&self, model_id: &uuid::Uuid) -> PathBuf {
        self.model_bazaar_dir.join("models").join(model_id.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deployment worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub model_id: uuid::Uuid,
    pub model_type: crate::model::ModelType,
    pub model_bazaar_dir: PathBuf,
    pub model_bazaar_endpoint: String,
    /// Secret used both to authenticate callers and to call back into the
    /// control plane's update-status endpoint.
    pub job_token: String,
    pub nomad_endpoint: String,
    pub task_runner_token: String,
    /// Id of the guardrail classifier composed in front of retrieval.
    pub guardrail_id: Option<uuid::Uuid>,
    /// OpenAI-compatible endpoint for answer generation. Absent
    /// disables the `generate_answer` option.
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub host: String,
    pub port: u16,
    /// Shutdown after this many seconds without an authenticated hit.
    pub idle_shutdown_secs: u64,
    /// Writer saves a snapshot after this much idle time.
    pub writer_save_interval_secs: u64,
    /// ...or once this many updates accumulate, whichever comes first.
    pub writer_save_batch_size: usize,
    /// 1-in-N sampling for prediction telemetry.
    pub telemetry_sample_rate: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let mut env = EnvReader::new();
        let model_id_raw = env.required("MODEL_ID")?;
        let model_id = model_id_raw.parse().map_err(|_| {
            Error::InvalidArgument(format!("MODEL_ID is not a UUID: {model_id_raw:?}"))
        })?;
        let type_raw = env.required("MODEL_TYPE")?;
        let model_type = serde_json::from_value(serde_json::Value::String(type_raw.clone()))
            .map_err(|_| Error::InvalidArgument(format!("unknown MODEL_TYPE {type_raw:?}")))?;
        let guardrail_id = match env.optional("GUARDRAIL_ID") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("GUARDRAIL_ID is not a UUID: {raw:?}"))
            })?),
            None => None,
        };
        let cfg = Self {
            model_id,
            model_type,
            model_bazaar_dir: PathBuf::from(env.required("MODEL_BAZAAR_DIR")?),
            model_bazaar_endpoint: env.required("MODEL_BAZAAR_ENDPOINT")?,
            job_token: env.required("JOB_TOKEN")?,
            nomad_endpoint: env.required("NOMAD_ENDPOINT")?,
            task_runner_token: env.required("TASK_RUNNER_TOKEN")?,
            guardrail_id,
            llm_base_url: env.optional("MB_LLM_BASE_URL"),
            llm_api_key: env.optional("MB_LLM_API_KEY"),
            llm_model: env.optional("MB_LLM_MODEL"),
            host: env.optional("MB_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.parsed("MB_PORT", 8010u16)?,
            idle_shutdown_secs: env.parsed("MB_IDLE_SHUTDOWN_SECS", 900u64)?,
            writer_save_interval_secs: env.parsed("MB_WRITER_SAVE_INTERVAL_SECS", 10u64)?,
            writer_save_batch_size: env.parsed("MB_WRITER_SAVE_BATCH_SIZE", 64usize)?,
            telemetry_sample_rate: env.parsed("MB_TELEMETRY_SAMPLE_RATE", 10u32)?,
        };
        env.reject_unknown()?;
        Ok(cfg)
    }

    /// The artifact directory this worker serves.
    pub fn artifact_path(&self) -> PathBuf {
        self.model_bazaar_dir.join("models").join(self.model_id.to_string())
    }

    /// The directory holding per-replica update logs.
    pub fn deployment_dir(&self) -> PathBuf {
        self.model_bazaar_dir
            .join("deployments")
            .join(self.model_id.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM cache job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub model_bazaar_dir: PathBuf,
    pub jwt_secret: String,
    /// Similarity gate for cache hits.
    pub threshold: f64,
    pub host: String,
    pub port: u16,
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        let mut env = EnvReader::new();
        let cfg = Self {
            model_bazaar_dir: PathBuf::from(env.required("MODEL_BAZAAR_DIR")?),
            jwt_secret: env.required("JWT_SECRET")?,
            threshold: env.parsed("LLM_CACHE_THRESHOLD", 0.95f64)?,
            host: env.optional("MB_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.parsed("MB_PORT", 8020u16)?,
        };
        env.reject_unknown()?;
        if !(0.0..=1.0).contains(&cfg.threshold) {
            return Err(Error::InvalidArgument(
                "LLM_CACHE_THRESHOLD must be in [0, 1]".into(),
            ));
        }
        Ok(cfg)
    }

    pub fn index_path(&self) -> PathBuf {
        self.model_bazaar_dir.join("llm_cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses its own key names to
    // stay independent under the parallel test runner.

    #[test]
    fn required_rejects_missing_and_empty() {
        let mut env = EnvReader::new();
        assert!(env.required("MB_TEST_DEFINITELY_UNSET").is_err());
        std::env::set_var("MB_TEST_EMPTY_VALUE", "");
        assert!(env.required("MB_TEST_EMPTY_VALUE").is_err());
    }

    #[test]
    fn parsed_applies_default_and_rejects_garbage() {
        let mut env = EnvReader::new();
        assert_eq!(env.parsed("MB_TEST_UNSET_PORT", 8000u16).unwrap(), 8000);
        std::env::set_var("MB_TEST_BAD_PORT", "not-a-port");
        assert!(env.parsed("MB_TEST_BAD_PORT", 8000u16).is_err());
    }

    #[test]
    fn unknown_mb_vars_are_rejected() {
        std::env::set_var("MB_TEST_TYPO_KNOB", "1");
        let env = EnvReader::new();
        let err = env.reject_unknown().unwrap_err();
        assert!(err.to_string().contains("MB_TEST_TYPO_KNOB"));
        std::env::remove_var("MB_TEST_TYPO_KNOB");
    }
}
