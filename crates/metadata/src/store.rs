//! The embedded metadata store.
//!
//! All tables live in one [`Tables`] document behind a `parking_lot`
//! RwLock, persisted with write-to-temp + rename after every successful
//! mutation. Mutations run against a copy of the tables and are swapped
//! in only when both the closure and the disk write succeed, so a failed
//! validation or a full disk can never leave half a transaction visible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_domain::model::{AccessLevel, Status, TeamRole};

use crate::schema::{
    CatalogEntry, Integration, Model, ModelAttribute, ModelDependency, Team, Usage, User,
    UserTeam,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    users: HashMap<Uuid, User>,
    teams: HashMap<Uuid, Team>,
    user_teams: Vec<UserTeam>,
    models: HashMap<Uuid, Model>,
    dependencies: Vec<ModelDependency>,
    attributes: Vec<ModelAttribute>,
    catalog: Vec<CatalogEntry>,
    usage: HashMap<Uuid, Usage>,
    integrations: HashMap<Uuid, Integration>,
    /// Bumped on every User/Team/Model write; feeds the permission cache.
    generation: u64,
}

/// Which of a model's three lifecycle statuses a transition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Train,
    Deploy,
    CacheRefresh,
}

pub struct MetadataStore {
    inner: RwLock<Tables>,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (or create) the store backing file.
    ///
    /// `uri` accepts a bare path or a `file:`/`file://` URI, per
    /// `DATABASE_URI`.
    pub fn open(uri: &str) -> Result<Self> {
        let path = PathBuf::from(
            uri.strip_prefix("file://")
                .or_else(|| uri.strip_prefix("file:"))
                .unwrap_or(uri),
        );
        let tables = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("corrupt metadata store {path:?}: {e}")))?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Tables::default()
        };
        tracing::info!(path = %path.display(), models = tables.models.len(), "metadata store open");
        Ok(Self {
            inner: RwLock::new(tables),
            path,
        })
    }

    /// Current store generation. Any User/Team/Model write bumps it.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.inner.read())
    }

    /// Run a transactional mutation. The closure gets a private copy of
    /// the tables; the copy replaces the live tables only after the
    /// closure succeeds and the new document is durably on disk.
    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.write();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.generation += 1;
        persist(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    // ── Users ────────────────────────────────────────────────────────

    pub fn create_user(&self, user: User) -> Result<User> {
        self.mutate(|t| {
            if t.users.values().any(|u| u.username == user.username) {
                return Err(Error::AlreadyExists(format!(
                    "user {} already exists",
                    user.username
                )));
            }
            if let Some(email) = &user.email {
                if t.users.values().any(|u| u.email.as_deref() == Some(email)) {
                    return Err(Error::AlreadyExists(format!("email {email} already in use")));
                }
            }
            t.users.insert(user.id, user.clone());
            Ok(user)
        })
    }

    pub fn user(&self, id: Uuid) -> Result<User> {
        self.read(|t| t.users.get(&id).cloned())
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    pub fn user_by_username(&self, username: &str) -> Option<User> {
        self.read(|t| t.users.values().find(|u| u.username == username).cloned())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        self.read(|t| {
            t.users
                .values()
                .find(|u| u.email.as_deref() == Some(email))
                .cloned()
        })
    }

    pub fn list_users(&self) -> Vec<User> {
        self.read(|t| {
            let mut users: Vec<_> = t.users.values().cloned().collect();
            users.sort_by(|a, b| a.username.cmp(&b.username));
            users
        })
    }

    pub fn set_password_hash(&self, user_id: Uuid, hash: String) -> Result<()> {
        self.mutate(|t| {
            let user = t
                .users
                .get_mut(&user_id)
                .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
            user.password_hash = Some(hash);
            Ok(())
        })
    }

    pub fn set_global_admin(&self, user_id: Uuid, admin: bool) -> Result<()> {
        self.mutate(|t| {
            let user = t
                .users
                .get_mut(&user_id)
                .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
            user.global_admin = admin;
            Ok(())
        })
    }

    /// Delete a user, reassigning every model they own: protected models
    /// go to a team admin of the model's team, everything else to a
    /// global admin. Fails if some model has no eligible new owner.
    pub fn delete_user(&self, user_id: Uuid) -> Result<()> {
        self.mutate(|t| {
            if !t.users.contains_key(&user_id) {
                return Err(Error::NotFound(format!("user {user_id}")));
            }
            let fallback_admin = t
                .users
                .values()
                .find(|u| u.global_admin && u.id != user_id)
                .map(|u| u.id);
            let owned: Vec<Uuid> = t
                .models
                .values()
                .filter(|m| m.user_id == user_id && !m.deleted)
                .map(|m| m.id)
                .collect();
            for model_id in owned {
                let model = &t.models[&model_id];
                let team_admin = model.team_id.and_then(|team_id| {
                    t.user_teams
                        .iter()
                        .find(|ut| {
                            ut.team_id == team_id
                                && ut.role == TeamRole::TeamAdmin
                                && ut.user_id != user_id
                        })
                        .map(|ut| ut.user_id)
                });
                let new_owner = if model.access_level == AccessLevel::Protected {
                    team_admin.or(fallback_admin)
                } else {
                    fallback_admin
                };
                let owner = new_owner.ok_or_else(|| {
                    Error::PreconditionFailed(format!(
                        "no eligible owner to reassign model {model_id}"
                    ))
                })?;
                if let Some(m) = t.models.get_mut(&model_id) {
                    m.user_id = owner;
                }
            }
            t.users.remove(&user_id);
            t.user_teams.retain(|ut| ut.user_id != user_id);
            Ok(())
        })
    }

    // ── Teams ────────────────────────────────────────────────────────

    pub fn create_team(&self, name: &str) -> Result<Team> {
        self.mutate(|t| {
            if t.teams.values().any(|team| team.name == name) {
                return Err(Error::AlreadyExists(format!("team {name} already exists")));
            }
            let team = Team {
                id: Uuid::new_v4(),
                name: name.to_string(),
            };
            t.teams.insert(team.id, team.clone());
            Ok(team)
        })
    }

    pub fn team(&self, id: Uuid) -> Result<Team> {
        self.read(|t| t.teams.get(&id).cloned())
            .ok_or_else(|| Error::NotFound(format!("team {id}")))
    }

    pub fn list_teams(&self) -> Vec<Team> {
        self.read(|t| t.teams.values().cloned().collect())
    }

    pub fn add_team_member(&self, team_id: Uuid, user_id: Uuid, role: TeamRole) -> Result<()> {
        self.mutate(|t| {
            if !t.teams.contains_key(&team_id) {
                return Err(Error::NotFound(format!("team {team_id}")));
            }
            if !t.users.contains_key(&user_id) {
                return Err(Error::NotFound(format!("user {user_id}")));
            }
            if let Some(existing) = t
                .user_teams
                .iter_mut()
                .find(|ut| ut.team_id == team_id && ut.user_id == user_id)
            {
                existing.role = role;
            } else {
                t.user_teams.push(UserTeam {
                    user_id,
                    team_id,
                    role,
                });
            }
            Ok(())
        })
    }

    pub fn remove_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<()> {
        self.mutate(|t| {
            let before = t.user_teams.len();
            t.user_teams
                .retain(|ut| !(ut.team_id == team_id && ut.user_id == user_id));
            if t.user_teams.len() == before {
                return Err(Error::NotFound(format!(
                    "user {user_id} is not in team {team_id}"
                )));
            }
            Ok(())
        })
    }

    pub fn team_role(&self, user_id: Uuid, team_id: Uuid) -> Option<TeamRole> {
        self.read(|t| {
            t.user_teams
                .iter()
                .find(|ut| ut.user_id == user_id && ut.team_id == team_id)
                .map(|ut| ut.role)
        })
    }

    pub fn teams_of(&self, user_id: Uuid) -> Vec<UserTeam> {
        self.read(|t| {
            t.user_teams
                .iter()
                .filter(|ut| ut.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    // ── Models ───────────────────────────────────────────────────────

    /// Insert a model, enforcing `(owner, name)` uniqueness. When
    /// `overwrite` is set and the existing model's train status is
    /// `failed`, the old row is soft-deleted and replaced.
    pub fn create_model(&self, model: Model, overwrite: bool) -> Result<Model> {
        self.mutate(|t| {
            let duplicate = t
                .models
                .values()
                .find(|m| m.user_id == model.user_id && m.name == model.name && !m.deleted)
                .map(|m| (m.id, m.train_status));
            if let Some((existing_id, train_status)) = duplicate {
                if overwrite && train_status == Status::Failed {
                    if let Some(old) = t.models.get_mut(&existing_id) {
                        old.deleted = true;
                    }
                } else {
                    return Err(Error::AlreadyExists(format!(
                        "model {} already exists for this user",
                        model.name
                    )));
                }
            }
            t.models.insert(model.id, model.clone());
            t.usage.entry(model.id).or_default();
            Ok(model)
        })
    }

    /// Create a workflow model together with its dependency and
    /// attribute rows in one transaction.
    pub fn create_workflow(
        &self,
        model: Model,
        dependencies: Vec<Uuid>,
        attributes: Vec<(String, String)>,
    ) -> Result<Model> {
        self.mutate(|t| {
            if t.models
                .values()
                .any(|m| m.user_id == model.user_id && m.name == model.name && !m.deleted)
            {
                return Err(Error::AlreadyExists(format!(
                    "model {} already exists for this user",
                    model.name
                )));
            }
            for dep in &dependencies {
                if !t.models.contains_key(dep) {
                    return Err(Error::NotFound(format!("dependency model {dep}")));
                }
            }
            for dep in dependencies {
                t.dependencies.push(ModelDependency {
                    model_id: model.id,
                    dependency_id: dep,
                });
            }
            for (key, value) in attributes {
                t.attributes.push(ModelAttribute {
                    model_id: model.id,
                    key,
                    value,
                });
            }
            t.models.insert(model.id, model.clone());
            t.usage.entry(model.id).or_default();
            Ok(model)
        })
    }

    pub fn model(&self, id: Uuid) -> Result<Model> {
        self.read(|t| t.models.get(&id).filter(|m| !m.deleted).cloned())
            .ok_or_else(|| Error::NotFound(format!("model {id}")))
    }

    pub fn model_by_owner_name(&self, owner: Uuid, name: &str) -> Option<Model> {
        self.read(|t| {
            t.models
                .values()
                .find(|m| m.user_id == owner && m.name == name && !m.deleted)
                .cloned()
        })
    }

    pub fn list_models(&self) -> Vec<Model> {
        self.read(|t| {
            let mut models: Vec<_> = t.models.values().filter(|m| !m.deleted).cloned().collect();
            models.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            models
        })
    }

    /// Apply a status transition, rejecting illegal edges. The
    /// `complete → stopped` demotion only exists for deploy status.
    pub fn transition(
        &self,
        model_id: Uuid,
        kind: StatusKind,
        next: Status,
        message: Option<String>,
    ) -> Result<Model> {
        self.mutate(|t| {
            let model = t
                .models
                .get_mut(&model_id)
                .filter(|m| !m.deleted)
                .ok_or_else(|| Error::NotFound(format!("model {model_id}")))?;
            let (current, allow_stop) = match kind {
                StatusKind::Train => (model.train_status, false),
                StatusKind::Deploy => (model.deploy_status, true),
                StatusKind::CacheRefresh => (model.cache_refresh_status, false),
            };
            if !current.can_transition(next, allow_stop) {
                return Err(Error::PreconditionFailed(format!(
                    "illegal status transition {current} -> {next}"
                )));
            }
            match kind {
                StatusKind::Train => model.train_status = next,
                StatusKind::Deploy => model.deploy_status = next,
                StatusKind::CacheRefresh => model.cache_refresh_status = next,
            }
            if message.is_some() {
                model.status_message = message;
            }
            Ok(model.clone())
        })
    }

    /// Admin-only reset back to `not_started`, the one sanctioned
    /// reverse path.
    pub fn reset_status(&self, model_id: Uuid, kind: StatusKind) -> Result<Model> {
        self.mutate(|t| {
            let model = t
                .models
                .get_mut(&model_id)
                .filter(|m| !m.deleted)
                .ok_or_else(|| Error::NotFound(format!("model {model_id}")))?;
            match kind {
                StatusKind::Train => model.train_status = Status::NotStarted,
                StatusKind::Deploy => model.deploy_status = Status::NotStarted,
                StatusKind::CacheRefresh => model.cache_refresh_status = Status::NotStarted,
            }
            model.status_message = Some("status reset by admin".to_string());
            Ok(model.clone())
        })
    }

    /// Soft-delete: the row is retained (hidden from listings) and any
    /// deployment is marked stopped. The caller stops the scheduler job.
    pub fn delete_model(&self, model_id: Uuid) -> Result<Model> {
        self.mutate(|t| {
            let model = t
                .models
                .get_mut(&model_id)
                .filter(|m| !m.deleted)
                .ok_or_else(|| Error::NotFound(format!("model {model_id}")))?;
            model.deleted = true;
            if matches!(
                model.deploy_status,
                Status::Starting | Status::InProgress | Status::Complete
            ) {
                model.deploy_status = Status::Stopped;
            }
            model.status_message = Some("model deleted".to_string());
            Ok(model.clone())
        })
    }

    pub fn dependencies_of(&self, model_id: Uuid) -> Vec<Uuid> {
        self.read(|t| {
            t.dependencies
                .iter()
                .filter(|d| d.model_id == model_id)
                .map(|d| d.dependency_id)
                .collect()
        })
    }

    pub fn attributes_of(&self, model_id: Uuid) -> Vec<ModelAttribute> {
        self.read(|t| {
            t.attributes
                .iter()
                .filter(|a| a.model_id == model_id)
                .cloned()
                .collect()
        })
    }

    // ── Usage ────────────────────────────────────────────────────────

    pub fn record_usage(
        &self,
        model_id: Uuid,
        requests: u64,
        bytes_stored: u64,
        cpu_seconds: f64,
    ) -> Result<()> {
        self.mutate(|t| {
            let usage = t.usage.entry(model_id).or_default();
            usage.requests += requests;
            usage.bytes_stored += bytes_stored;
            usage.cpu_seconds += cpu_seconds;
            Ok(())
        })
    }

    pub fn usage_of(&self, model_id: Uuid) -> Usage {
        self.read(|t| t.usage.get(&model_id).cloned().unwrap_or_default())
    }

    // ── Catalog & integrations ───────────────────────────────────────

    pub fn add_catalog_entry(&self, entry: CatalogEntry) -> Result<()> {
        self.mutate(|t| {
            t.catalog.push(entry);
            Ok(())
        })
    }

    pub fn list_catalog(&self) -> Vec<CatalogEntry> {
        self.read(|t| t.catalog.clone())
    }

    pub fn upsert_integration(&self, integration: Integration) -> Result<()> {
        self.mutate(|t| {
            t.integrations.insert(integration.id, integration);
            Ok(())
        })
    }

    pub fn list_integrations(&self) -> Vec<Integration> {
        self.read(|t| t.integrations.values().cloned().collect())
    }
}

/// Atomic write: serialize to a sibling temp file, then rename over the
/// live document.
fn persist(path: &Path, tables: &Tables) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(tables)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mb_domain::model::{ModelSubType, ModelType};
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, Arc<MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MetadataStore::open(dir.path().join("metadata.json").to_str().unwrap()).unwrap();
        (dir, Arc::new(store))
    }

    fn user(name: &str, domain: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            email: Some(format!("{name}@{domain}")),
            global_admin: false,
            domain: domain.to_string(),
            password_hash: None,
            created_at: Utc::now(),
        }
    }

    fn model(owner: Uuid, name: &str) -> Model {
        Model {
            id: Uuid::new_v4(),
            user_id: owner,
            team_id: None,
            name: name.to_string(),
            model_type: ModelType::Ndb,
            sub_type: ModelSubType::None,
            domain: "x.com".to_string(),
            access_level: AccessLevel::Private,
            parent_id: None,
            train_status: Status::Starting,
            deploy_status: Status::NotStarted,
            cache_refresh_status: Status::NotStarted,
            status_message: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn username_and_email_are_unique() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let mut dup = user("alice", "y.com");
        dup.email = Some("other@y.com".into());
        assert!(matches!(
            store.create_user(dup),
            Err(Error::AlreadyExists(_))
        ));
        let mut email_dup = user("bob", "x.com");
        email_dup.email = alice.email.clone();
        assert!(matches!(
            store.create_user(email_dup),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn duplicate_model_name_is_rejected() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        store.create_model(model(alice.id, "docs"), false).unwrap();
        assert!(matches!(
            store.create_model(model(alice.id, "docs"), false),
            Err(Error::AlreadyExists(_))
        ));
        // Same name under a different owner is fine.
        let bob = store.create_user(user("bob", "x.com")).unwrap();
        store.create_model(model(bob.id, "docs"), false).unwrap();
    }

    #[test]
    fn overwrite_requires_failed_predecessor() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let first = store.create_model(model(alice.id, "docs"), false).unwrap();
        // Still starting: overwrite refused.
        assert!(store.create_model(model(alice.id, "docs"), true).is_err());
        store
            .transition(first.id, StatusKind::Train, Status::Failed, None)
            .unwrap();
        let replacement = store.create_model(model(alice.id, "docs"), true).unwrap();
        assert_ne!(replacement.id, first.id);
        assert!(store.model(first.id).is_err(), "old row is soft-deleted");
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let m = store.create_model(model(alice.id, "docs"), false).unwrap();
        store
            .transition(m.id, StatusKind::Train, Status::InProgress, None)
            .unwrap();
        store
            .transition(m.id, StatusKind::Train, Status::Complete, None)
            .unwrap();
        let err = store
            .transition(m.id, StatusKind::Train, Status::InProgress, None)
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
        // complete -> stopped exists only for deploy status.
        assert!(store
            .transition(m.id, StatusKind::Train, Status::Stopped, None)
            .is_err());
    }

    #[test]
    fn deploy_demotes_complete_to_stopped() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let m = store.create_model(model(alice.id, "docs"), false).unwrap();
        for next in [Status::Starting, Status::InProgress, Status::Complete] {
            store
                .transition(m.id, StatusKind::Deploy, next, None)
                .unwrap();
        }
        let updated = store
            .transition(
                m.id,
                StatusKind::Deploy,
                Status::Stopped,
                Some("scheduler reports job dead".into()),
            )
            .unwrap();
        assert_eq!(updated.deploy_status, Status::Stopped);
        assert!(updated.status_message.unwrap().contains("dead"));
    }

    #[test]
    fn concurrent_same_name_creates_yield_one_winner() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let owner = alice.id;
            handles.push(std::thread::spawn(move || {
                store.create_model(model(owner, "docs"), false).is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn delete_user_reassigns_protected_models_to_team_admin() {
        let (_dir, store) = store();
        let admin = {
            let mut u = user("root", "x.com");
            u.global_admin = true;
            store.create_user(u).unwrap()
        };
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let carol = store.create_user(user("carol", "x.com")).unwrap();
        let team = store.create_team("search").unwrap();
        store
            .add_team_member(team.id, alice.id, TeamRole::Member)
            .unwrap();
        store
            .add_team_member(team.id, carol.id, TeamRole::TeamAdmin)
            .unwrap();

        let mut protected = model(alice.id, "docs");
        protected.access_level = AccessLevel::Protected;
        protected.team_id = Some(team.id);
        let protected = store.create_model(protected, false).unwrap();
        let private = store.create_model(model(alice.id, "notes"), false).unwrap();

        store.delete_user(alice.id).unwrap();
        assert_eq!(store.model(protected.id).unwrap().user_id, carol.id);
        assert_eq!(store.model(private.id).unwrap().user_id, admin.id);
    }

    #[test]
    fn generation_bumps_on_writes_and_survives_reload() {
        let (dir, store) = store();
        let g0 = store.generation();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        store.create_model(model(alice.id, "docs"), false).unwrap();
        assert!(store.generation() > g0);

        let reopened =
            MetadataStore::open(dir.path().join("metadata.json").to_str().unwrap()).unwrap();
        assert_eq!(reopened.generation(), store.generation());
        assert!(reopened.user_by_username("alice").is_some());
    }

    #[test]
    fn failed_transaction_leaves_no_partial_writes() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com")).unwrap();
        let dep = Uuid::new_v4(); // does not exist
        let err = store
            .create_workflow(model(alice.id, "wf"), vec![dep], vec![])
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.model_by_owner_name(alice.id, "wf").is_none());
        assert!(store.dependencies_of(dep).is_empty());
    }
}
