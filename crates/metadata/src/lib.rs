//! Metadata store — persistent ground truth for users, teams, models,
//! dependencies, and lifecycle statuses.
//!
//! The schema is relational in shape (`schema` module); the embedded
//! store keeps all tables behind one `RwLock` and persists the whole
//! document atomically on every mutation. All multi-row writes go through
//! a single closure under the write lock, which is what gives the
//! reconciler and request handlers `SELECT … FOR UPDATE` semantics
//! against each other.

pub mod schema;
pub mod store;

pub use schema::{
    CatalogEntry, Integration, IntegrationData, Model, ModelAttribute, ModelDependency, Team,
    Usage, User, UserTeam,
};
pub use store::MetadataStore;
