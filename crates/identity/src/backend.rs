//! The identity backend seam.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::config::GatewayConfig;
use mb_domain::error::{Error, Result};
use mb_metadata::{MetadataStore, User};

use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Capability set every identity backend provides. Backends own user
/// provisioning and credential checks; authorization stays in
/// [`crate::permissions`] regardless of backend.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Check credentials and return the local user row.
    async fn authenticate(&self, username_or_email: &str, password: &str) -> Result<User>;

    /// Provision a user. Backends that delegate user management reject
    /// this with `forbidden`.
    async fn create_user(&self, signup: SignupRequest) -> Result<User>;

    async fn delete_user(&self, user_id: Uuid) -> Result<()>;

    /// Start a password reset: issue a short-lived single-use code and
    /// hand it to the mailer.
    async fn request_password_reset(&self, email: &str) -> Result<()>;

    /// Complete a password reset with a previously issued code.
    async fn reset_password(&self, email: &str, code: &str, new_password: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Build the configured backend. `IDENTITY_PROVIDER=password` selects
/// the embedded table; `oidc` delegates to the external provider.
pub fn from_config(
    config: &GatewayConfig,
    store: Arc<MetadataStore>,
    mailer: Arc<dyn crate::mailer::Mailer>,
) -> Result<Arc<dyn IdentityBackend>> {
    match config.identity_provider.as_str() {
        "password" => Ok(Arc::new(crate::password::PasswordBackend::new(store, mailer))),
        "oidc" => {
            let issuer = config
                .oidc_issuer
                .clone()
                .ok_or_else(|| Error::InvalidArgument("OIDC_ISSUER is required".into()))?;
            let client_id = config
                .oidc_client_id
                .clone()
                .ok_or_else(|| Error::InvalidArgument("OIDC_CLIENT_ID is required".into()))?;
            Ok(Arc::new(crate::oidc::OidcBackend::new(
                store,
                issuer,
                client_id,
                config.oidc_client_secret.clone(),
            )))
        }
        other => Err(Error::InvalidArgument(format!(
            "unknown identity provider {other:?}"
        ))),
    }
}
