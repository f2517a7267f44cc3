//! Identity & permission resolver.
//!
//! Two pluggable identity backends (embedded password table, external
//! OIDC provider) sit behind one [`IdentityBackend`] trait; access
//! tokens are HS256 JWTs; permission decisions are cached per-process
//! with a 5-minute TTL and invalidated by the metadata store's
//! generation counter.

pub mod backend;
pub mod mailer;
pub mod oidc;
pub mod password;
pub mod permissions;
pub mod token;

pub use backend::{IdentityBackend, SignupRequest};
pub use permissions::{Decision, PermissionResolver};
pub use token::TokenSigner;
