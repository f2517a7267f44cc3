//! HS256 token issuance and verification.
//!
//! Access tokens carry `{sub: user_id, exp}` and live 15 minutes; cache
//! scope tokens additionally bind a `model_id`. Verification tolerates
//! 60 seconds of clock skew.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mb_domain::error::{Error, Result};

pub const ACCESS_TOKEN_MINUTES: i64 = 15;
pub const CACHE_TOKEN_MINUTES: i64 = 15;
const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: Uuid,
    pub exp: i64,
}

/// Long-lived credential injected into scheduler jobs. The worker both
/// presents it to callers and uses it to report status back.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobClaims {
    /// The model this job serves.
    pub model_id: Uuid,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheClaims {
    /// User id the token was issued to.
    pub sub: Uuid,
    /// The model this token may insert cache entries for.
    pub model_id: Uuid,
    /// Issue time; the cache compares it against invalidation timestamps.
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    fn validation() -> Validation {
        let mut validation = Validation::default();
        validation.leeway = LEEWAY_SECS;
        validation
    }

    pub fn issue_access(&self, user_id: Uuid) -> Result<String> {
        let claims = AccessClaims {
            sub: user_id,
            exp: (Utc::now() + chrono::Duration::minutes(ACCESS_TOKEN_MINUTES)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encode: {e}")))
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims> {
        decode::<AccessClaims>(token, &self.decoding, &Self::validation())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Unauthorized("token expired".into())
                }
                _ => Error::Unauthorized("invalid token".into()),
            })
    }

    /// Reissue a fresh access token against a still-valid one.
    pub fn refresh(&self, token: &str) -> Result<String> {
        let claims = self.verify_access(token)?;
        self.issue_access(claims.sub)
    }

    /// Issue the credential baked into a scheduler job's environment.
    /// Jobs can run for months between restarts, so the lifetime is a
    /// year rather than minutes.
    pub fn issue_job(&self, model_id: Uuid) -> Result<String> {
        let claims = JobClaims {
            model_id,
            exp: (Utc::now() + chrono::Duration::days(365)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encode: {e}")))
    }

    pub fn verify_job(&self, token: &str) -> Result<JobClaims> {
        decode::<JobClaims>(token, &self.decoding, &Self::validation())
            .map(|data| data.claims)
            .map_err(|_| Error::Unauthorized("invalid job token".into()))
    }

    pub fn issue_cache_scope(&self, user_id: Uuid, model_id: Uuid) -> Result<String> {
        let now = Utc::now();
        let claims = CacheClaims {
            sub: user_id,
            model_id,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::minutes(CACHE_TOKEN_MINUTES)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encode: {e}")))
    }

    /// Verify a cache-scope token and check it is bound to `model_id`.
    pub fn verify_cache_scope(&self, token: &str, model_id: Uuid) -> Result<CacheClaims> {
        let claims = decode::<CacheClaims>(token, &self.decoding, &Self::validation())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Unauthorized("token expired".into())
                }
                _ => Error::Unauthorized("invalid token".into()),
            })?;
        if claims.model_id != model_id {
            return Err(Error::Forbidden(format!(
                "token is not scoped to model {model_id}"
            )));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_round_trips() {
        let signer = TokenSigner::new("secret");
        let user = Uuid::new_v4();
        let token = signer.issue_access(user).unwrap();
        let claims = signer.verify_access(&token).unwrap();
        assert_eq!(claims.sub, user);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signer = TokenSigner::new("secret");
        let other = TokenSigner::new("different");
        let token = signer.issue_access(Uuid::new_v4()).unwrap();
        let err = other.verify_access(&token).unwrap_err();
        assert!(err.to_string().starts_with("unauthorized"));
    }

    #[test]
    fn refresh_reissues_for_same_user() {
        let signer = TokenSigner::new("secret");
        let user = Uuid::new_v4();
        let token = signer.issue_access(user).unwrap();
        let refreshed = signer.refresh(&token).unwrap();
        assert_eq!(signer.verify_access(&refreshed).unwrap().sub, user);
    }

    #[test]
    fn job_token_round_trips() {
        let signer = TokenSigner::new("secret");
        let model = Uuid::new_v4();
        let token = signer.issue_job(model).unwrap();
        assert_eq!(signer.verify_job(&token).unwrap().model_id, model);
        assert!(signer.verify_job("garbage").is_err());
    }

    #[test]
    fn cache_scope_binds_model() {
        let signer = TokenSigner::new("secret");
        let user = Uuid::new_v4();
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        let token = signer.issue_cache_scope(user, m1).unwrap();
        assert!(signer.verify_cache_scope(&token, m1).is_ok());
        let err = signer.verify_cache_scope(&token, m2).unwrap_err();
        assert!(err.to_string().starts_with("forbidden"));
    }
}
