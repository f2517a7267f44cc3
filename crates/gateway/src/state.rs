use std::sync::Arc;

use mb_domain::config::GatewayConfig;
use mb_identity::{IdentityBackend, PermissionResolver, TokenSigner};
use mb_metadata::MetadataStore;
use mb_scheduler::{LicenseGate, SchedulerClient};

use crate::jobs::JobManager;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Persistence** — config, metadata store
/// - **Identity** — backend, token signer, permission resolver
/// - **Jobs** — scheduler client, license gate, job manager
#[derive(Clone)]
pub struct AppState {
    // ── Persistence ──────────────────────────────────────────────────
    pub config: Arc<GatewayConfig>,
    pub store: Arc<MetadataStore>,

    // ── Identity ─────────────────────────────────────────────────────
    pub identity: Arc<dyn IdentityBackend>,
    pub signer: TokenSigner,
    pub permissions: Arc<PermissionResolver>,

    // ── Jobs ─────────────────────────────────────────────────────────
    pub scheduler: Arc<dyn SchedulerClient>,
    pub license: Arc<LicenseGate>,
    pub jobs: Arc<JobManager>,

    /// Outbound calls to deployment workers and the cache job.
    pub http: reqwest::Client,
}
