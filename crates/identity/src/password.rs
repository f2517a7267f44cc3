//! Embedded password-table backend.
//!
//! Credentials live on the User row as a PHC-format PBKDF2-SHA256 hash
//! (salt embedded). Password resets issue a single-use code with a
//! 15-minute lifetime, delivered through the configured mailer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use pbkdf2::password_hash::rand_core::OsRng;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::RngCore;
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_metadata::{MetadataStore, User};

use crate::backend::{IdentityBackend, SignupRequest};
use crate::mailer::Mailer;

const RESET_CODE_MINUTES: i64 = 15;

struct ResetCode {
    code: String,
    expires_at: DateTime<Utc>,
}

pub struct PasswordBackend {
    store: Arc<MetadataStore>,
    mailer: Arc<dyn Mailer>,
    reset_codes: Mutex<HashMap<String, ResetCode>>,
}

impl PasswordBackend {
    pub fn new(store: Arc<MetadataStore>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            store,
            mailer,
            reset_codes: Mutex::new(HashMap::new()),
        }
    }

    fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Pbkdf2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| Error::Internal(format!("password hash: {e}")))
    }

    fn verify_password(password: &str, stored: &str) -> Result<()> {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| Error::Internal(format!("stored hash unparseable: {e}")))?;
        Pbkdf2
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Error::Unauthorized("invalid credentials".into()))
    }

    /// Domain of an email address, recorded on the user row and matched
    /// against protected models.
    fn email_domain(email: &str) -> Result<String> {
        email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_string())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("invalid email {email:?}")))
    }
}

#[async_trait]
impl IdentityBackend for PasswordBackend {
    async fn authenticate(&self, username_or_email: &str, password: &str) -> Result<User> {
        let user = self
            .store
            .user_by_email(username_or_email)
            .or_else(|| self.store.user_by_username(username_or_email))
            .ok_or_else(|| Error::Unauthorized("invalid credentials".into()))?;
        let stored = user
            .password_hash
            .as_deref()
            .ok_or_else(|| Error::Unauthorized("invalid credentials".into()))?;
        Self::verify_password(password, stored)?;
        Ok(user)
    }

    async fn create_user(&self, signup: SignupRequest) -> Result<User> {
        if signup.password.len() < 8 {
            return Err(Error::InvalidArgument(
                "password must be at least 8 characters".into(),
            ));
        }
        let domain = Self::email_domain(&signup.email)?;
        let user = User {
            id: Uuid::new_v4(),
            username: signup.username,
            email: Some(signup.email),
            global_admin: false,
            domain,
            password_hash: Some(Self::hash_password(&signup.password)?),
            created_at: Utc::now(),
        };
        self.store.create_user(user)
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<()> {
        self.store.delete_user(user_id)
    }

    async fn request_password_reset(&self, email: &str) -> Result<()> {
        let user = self
            .store
            .user_by_email(email)
            .ok_or_else(|| Error::NotFound(format!("no user with email {email}")))?;
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        let code = hex::encode(bytes);
        self.reset_codes.lock().insert(
            email.to_string(),
            ResetCode {
                code: code.clone(),
                expires_at: Utc::now() + Duration::minutes(RESET_CODE_MINUTES),
            },
        );
        self.mailer
            .send(
                email,
                "Password reset",
                &format!(
                    "Hello {},\n\nYour password reset code is {code}. It expires in {RESET_CODE_MINUTES} minutes.",
                    user.username
                ),
            )
            .await
    }

    async fn reset_password(&self, email: &str, code: &str, new_password: &str) -> Result<()> {
        if new_password.len() < 8 {
            return Err(Error::InvalidArgument(
                "password must be at least 8 characters".into(),
            ));
        }
        {
            let mut codes = self.reset_codes.lock();
            let entry = codes
                .get(email)
                .ok_or_else(|| Error::Unauthorized("no reset requested".into()))?;
            if entry.expires_at < Utc::now() {
                codes.remove(email);
                return Err(Error::Unauthorized("reset code expired".into()));
            }
            if entry.code != code {
                return Err(Error::Unauthorized("invalid reset code".into()));
            }
            // Single use.
            codes.remove(email);
        }
        let user = self
            .store
            .user_by_email(email)
            .ok_or_else(|| Error::NotFound(format!("no user with email {email}")))?;
        self.store
            .set_password_hash(user.id, Self::hash_password(new_password)?)
    }

    fn backend_name(&self) -> &'static str {
        "password"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::LogMailer;

    fn backend() -> (tempfile::TempDir, PasswordBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MetadataStore::open(dir.path().join("metadata.json").to_str().unwrap()).unwrap(),
        );
        (dir, PasswordBackend::new(store, Arc::new(LogMailer)))
    }

    fn signup(name: &str) -> SignupRequest {
        SignupRequest {
            username: name.to_string(),
            email: format!("{name}@x.com"),
            password: "pw1-long-enough".to_string(),
        }
    }

    #[tokio::test]
    async fn signup_then_login() {
        let (_dir, backend) = backend();
        let created = backend.create_user(signup("alice")).await.unwrap();
        assert_eq!(created.domain, "x.com");

        let by_name = backend.authenticate("alice", "pw1-long-enough").await.unwrap();
        assert_eq!(by_name.id, created.id);
        let by_email = backend
            .authenticate("alice@x.com", "pw1-long-enough")
            .await
            .unwrap();
        assert_eq!(by_email.id, created.id);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let (_dir, backend) = backend();
        backend.create_user(signup("alice")).await.unwrap();
        let err = backend.authenticate("alice", "wrong").await.unwrap_err();
        assert!(err.to_string().starts_with("unauthorized"));
    }

    #[tokio::test]
    async fn reset_code_is_single_use() {
        let (_dir, backend) = backend();
        backend.create_user(signup("alice")).await.unwrap();
        backend.request_password_reset("alice@x.com").await.unwrap();
        let code = backend.reset_codes.lock()["alice@x.com"].code.clone();

        backend
            .reset_password("alice@x.com", &code, "new-password-1")
            .await
            .unwrap();
        backend
            .authenticate("alice", "new-password-1")
            .await
            .unwrap();

        // Replaying the consumed code fails.
        let err = backend
            .reset_password("alice@x.com", &code, "new-password-2")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("unauthorized"));
    }

    #[tokio::test]
    async fn short_passwords_are_rejected() {
        let (_dir, backend) = backend();
        let mut req = signup("alice");
        req.password = "short".into();
        let err = backend.create_user(req).await.unwrap_err();
        assert!(err.to_string().starts_with("invalid_argument"));
    }
}
