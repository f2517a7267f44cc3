//! External OIDC backend.
//!
//! Login is delegated to the identity provider's token endpoint
//! (resource-owner password grant); the returned subject claim is mapped
//! to a local User row, created on first sight. User provisioning and
//! password management stay with the provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_metadata::{MetadataStore, User};

use crate::backend::{IdentityBackend, SignupRequest};

pub struct OidcBackend {
    store: Arc<MetadataStore>,
    client: reqwest::Client,
    issuer: String,
    client_id: String,
    client_secret: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl OidcBackend {
    pub fn new(
        store: Arc<MetadataStore>,
        issuer: String,
        client_id: String,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            issuer: issuer.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
        }
    }

    /// Map a provider subject onto a local user row, creating it on
    /// first sight. Lookup is by username.
    fn local_user(&self, info: UserInfo) -> Result<User> {
        let username = info.preferred_username.unwrap_or_else(|| info.sub.clone());
        if let Some(user) = self.store.user_by_username(&username) {
            return Ok(user);
        }
        let domain = info
            .email
            .as_deref()
            .and_then(|e| e.rsplit_once('@'))
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        tracing::info!(username, "provisioning user from identity provider");
        self.store.create_user(User {
            id: Uuid::new_v4(),
            username,
            email: info.email,
            global_admin: false,
            domain,
            password_hash: None,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl IdentityBackend for OidcBackend {
    async fn authenticate(&self, username_or_email: &str, password: &str) -> Result<User> {
        let mut form = vec![
            ("grant_type", "password".to_string()),
            ("client_id", self.client_id.clone()),
            ("username", username_or_email.to_string()),
            ("password", password.to_string()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let token_url = format!("{}/protocol/openid-connect/token", self.issuer);
        let response = self
            .client
            .post(&token_url)
            .form(&form)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("identity provider unreachable: {e}")))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized("invalid credentials".into()));
        }
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "identity provider returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("identity provider response: {e}")))?;

        let userinfo_url = format!("{}/protocol/openid-connect/userinfo", self.issuer);
        let info: UserInfo = self
            .client
            .get(&userinfo_url)
            .bearer_auth(&token.access_token)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("identity provider unreachable: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("identity provider response: {e}")))?;

        self.local_user(info)
    }

    async fn create_user(&self, _signup: SignupRequest) -> Result<User> {
        Err(Error::Forbidden(
            "user management is delegated to the identity provider".into(),
        ))
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<()> {
        // The provider account survives; only the local row is removed.
        self.store.delete_user(user_id)
    }

    async fn request_password_reset(&self, _email: &str) -> Result<()> {
        Err(Error::Forbidden(
            "password management is delegated to the identity provider".into(),
        ))
    }

    async fn reset_password(&self, _email: &str, _code: &str, _new_password: &str) -> Result<()> {
        Err(Error::Forbidden(
            "password management is delegated to the identity provider".into(),
        ))
    }

    fn backend_name(&self) -> &'static str {
        "oidc"
    }
}
