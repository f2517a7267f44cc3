//! Permission resolution with a bounded-staleness decision cache.
//!
//! Evaluation order: global admin, owner, team admin of the owning team,
//! access level (`public` read, `protected` read on matching domain).
//! Decisions are cached per `(user_id, model_id)` for at most 5 minutes
//! and dropped early whenever the metadata store generation moves, so a
//! User/Team/Model write invalidates every cached decision at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_domain::model::{AccessLevel, ModelOp, TeamRole};
use mb_metadata::{MetadataStore, Model, User};

pub const DECISION_TTL: Duration = Duration::from_secs(300);

/// What a user may do with a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decision {
    pub read: bool,
    pub write: bool,
}

impl Decision {
    pub fn allows(self, op: ModelOp) -> bool {
        match op {
            ModelOp::Read => self.read,
            ModelOp::Write => self.write,
        }
    }
}

/// Pure evaluation against one user/model pair. `team_role` is the
/// caller's role in the model's owning team, if any.
pub fn evaluate(user: &User, model: &Model, team_role: Option<TeamRole>) -> Decision {
    if user.global_admin || model.user_id == user.id {
        return Decision { read: true, write: true };
    }
    if team_role == Some(TeamRole::TeamAdmin) {
        return Decision { read: true, write: true };
    }
    let read = match model.access_level {
        AccessLevel::Public => true,
        AccessLevel::Protected => !model.domain.is_empty() && model.domain == user.domain,
        AccessLevel::Private => false,
    };
    Decision { read, write: false }
}

struct CachedDecision {
    decision: Decision,
    generation: u64,
    fetched_at: Instant,
}

pub struct PermissionResolver {
    store: Arc<MetadataStore>,
    cache: RwLock<HashMap<(Uuid, Uuid), CachedDecision>>,
    ttl: Duration,
}

impl PermissionResolver {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self::with_ttl(store, DECISION_TTL)
    }

    pub fn with_ttl(store: Arc<MetadataStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve the caller's decision for a model, consulting the cache.
    pub fn decision(&self, user_id: Uuid, model_id: Uuid) -> Result<Decision> {
        let generation = self.store.generation();
        if let Some(cached) = self.cache.read().get(&(user_id, model_id)) {
            if cached.generation == generation && cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.decision);
            }
        }

        let user = self.store.user(user_id)?;
        let model = self.store.model(model_id)?;
        let team_role = model
            .team_id
            .and_then(|team_id| self.store.team_role(user_id, team_id));
        let decision = evaluate(&user, &model, team_role);

        self.cache.write().insert(
            (user_id, model_id),
            CachedDecision {
                decision,
                generation,
                fetched_at: Instant::now(),
            },
        );
        Ok(decision)
    }

    /// Authorize `op` or fail with `forbidden`.
    pub fn authorize(&self, user_id: Uuid, model_id: Uuid, op: ModelOp) -> Result<()> {
        if self.decision(user_id, model_id)?.allows(op) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "user {user_id} may not {op:?} model {model_id}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mb_domain::model::{ModelSubType, ModelType, Status};
    use proptest::prelude::*;

    fn store() -> (tempfile::TempDir, Arc<MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MetadataStore::open(dir.path().join("metadata.json").to_str().unwrap()).unwrap();
        (dir, Arc::new(store))
    }

    fn user(name: &str, domain: &str, admin: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            email: Some(format!("{name}@{domain}")),
            global_admin: admin,
            domain: domain.to_string(),
            password_hash: None,
            created_at: Utc::now(),
        }
    }

    fn model(owner: Uuid, name: &str, access: AccessLevel, domain: &str) -> Model {
        Model {
            id: Uuid::new_v4(),
            user_id: owner,
            team_id: None,
            name: name.to_string(),
            model_type: ModelType::Ndb,
            sub_type: ModelSubType::None,
            domain: domain.to_string(),
            access_level: access,
            parent_id: None,
            train_status: Status::Complete,
            deploy_status: Status::NotStarted,
            cache_refresh_status: Status::NotStarted,
            status_message: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn owner_and_admin_get_write() {
        let alice = user("alice", "x.com", false);
        let root = user("root", "y.com", true);
        let m = model(alice.id, "docs", AccessLevel::Private, "x.com");
        assert_eq!(evaluate(&alice, &m, None), Decision { read: true, write: true });
        assert_eq!(evaluate(&root, &m, None), Decision { read: true, write: true });
    }

    #[test]
    fn protected_reads_require_matching_domain() {
        let owner = user("alice", "x.com", false);
        let same_domain = user("bob", "x.com", false);
        let other_domain = user("carol", "y.com", false);
        let m = model(owner.id, "docs", AccessLevel::Protected, "x.com");
        assert!(evaluate(&same_domain, &m, None).read);
        assert!(!evaluate(&same_domain, &m, None).write);
        assert!(!evaluate(&other_domain, &m, None).read);
    }

    #[test]
    fn team_admin_writes_member_does_not() {
        let owner = user("alice", "x.com", false);
        let peer = user("bob", "x.com", false);
        let m = model(owner.id, "docs", AccessLevel::Private, "x.com");
        assert!(evaluate(&peer, &m, Some(TeamRole::TeamAdmin)).write);
        assert!(!evaluate(&peer, &m, Some(TeamRole::Member)).read);
    }

    #[test]
    fn cache_is_dropped_when_generation_moves() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com", false)).unwrap();
        let bob = store.create_user(user("bob", "x.com", false)).unwrap();
        let m = store
            .create_model(model(alice.id, "docs", AccessLevel::Private, "x.com"), false)
            .unwrap();

        let resolver = PermissionResolver::new(store.clone());
        assert!(!resolver.decision(bob.id, m.id).unwrap().read);

        // Granting team-admin bumps the generation; the stale "no"
        // decision must not survive.
        let team = store.create_team("search").unwrap();
        store
            .add_team_member(team.id, bob.id, TeamRole::TeamAdmin)
            .unwrap();
        // Attach the team to the model through a fresh row.
        let mut with_team = model(alice.id, "docs2", AccessLevel::Private, "x.com");
        with_team.team_id = Some(team.id);
        let m2 = store.create_model(with_team, false).unwrap();
        assert!(resolver.decision(bob.id, m2.id).unwrap().write);
    }

    #[test]
    fn authorize_maps_to_forbidden() {
        let (_dir, store) = store();
        let alice = store.create_user(user("alice", "x.com", false)).unwrap();
        let bob = store.create_user(user("bob", "y.com", false)).unwrap();
        let m = store
            .create_model(model(alice.id, "docs", AccessLevel::Private, "x.com"), false)
            .unwrap();
        let resolver = PermissionResolver::new(store);
        let err = resolver.authorize(bob.id, m.id, ModelOp::Read).unwrap_err();
        assert!(err.to_string().starts_with("forbidden"));
    }

    // Permission closure: the resolver (with caching) must agree with a
    // direct evaluation of the rules for every reachable combination of
    // admin flag, ownership, access level, domain match, and team role.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn resolver_matches_direct_evaluation(
            caller_is_admin in any::<bool>(),
            caller_owns in any::<bool>(),
            domains_match in any::<bool>(),
            access in prop::sample::select(vec![
                AccessLevel::Public,
                AccessLevel::Protected,
                AccessLevel::Private,
            ]),
            team_role in prop::sample::select(vec![
                None,
                Some(TeamRole::Member),
                Some(TeamRole::TeamAdmin),
            ]),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(
                MetadataStore::open(dir.path().join("metadata.json").to_str().unwrap()).unwrap(),
            );
            let owner = store.create_user(user("owner", "x.com", false)).unwrap();
            let caller_domain = if domains_match { "x.com" } else { "y.com" };
            let caller = store
                .create_user(user("caller", caller_domain, caller_is_admin))
                .unwrap();

            let mut m = model(
                if caller_owns { caller.id } else { owner.id },
                "docs",
                access,
                "x.com",
            );
            if let Some(role) = team_role {
                let team = store.create_team("team").unwrap();
                store.add_team_member(team.id, caller.id, role).unwrap();
                m.team_id = Some(team.id);
            }
            let m = store.create_model(m, false).unwrap();

            let resolver = PermissionResolver::new(store.clone());
            let via_resolver = resolver.decision(caller.id, m.id).unwrap();
            let direct = evaluate(
                &store.user(caller.id).unwrap(),
                &store.model(m.id).unwrap(),
                m.team_id.and_then(|t| store.team_role(caller.id, t)),
            );
            prop_assert_eq!(via_resolver, direct);

            // And the rules themselves: read access iff one of the
            // grant conditions holds.
            let expected_read = caller_is_admin
                || caller_owns
                || team_role == Some(TeamRole::TeamAdmin)
                || access == AccessLevel::Public
                || (access == AccessLevel::Protected && domains_match);
            prop_assert_eq!(via_resolver.read, expected_read);
        }
    }
}
