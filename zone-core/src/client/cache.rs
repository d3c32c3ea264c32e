//! Per-client materialized cache (spec §4.4).
//!
//! One instance lives inside each client channel task; only that task
//! ever mutates it (spec §5 "per-process caches are private"), mirroring
//! [`crate::gateway::cache::GatewayCache`]'s single-owner discipline but
//! over policies/resources/memberships instead of flows.

use std::collections::HashMap;

use crate::domain::{
    ActorGroupId, ActorId, MembershipId, Policy, PolicyId, Resource, ResourceId, ResourceType,
    SiteId,
};
use crate::policy::{evaluate, fold_token_expiry, longest_conforming, Candidate, EvaluationContext, Outcome};
use crate::transport::version::{client_supports_internet_resource, ProtocolVersion};

#[derive(Debug, Default)]
pub struct ClientCache {
    actor_id: Option<ActorId>,
    policies: HashMap<PolicyId, Policy>,
    resources: HashMap<ResourceId, Resource>,
    /// Site name, denormalized onto the resources that reference it —
    /// kept alongside the resource map rather than inside [`Resource`]
    /// because the domain model has no wire concept of a site name.
    site_names: HashMap<SiteId, String>,
    memberships: HashMap<ActorGroupId, Option<MembershipId>>,
    connectable_resources: HashMap<ResourceId, Resource>,
}

/// Outcome of [`ClientCache::authorize_resource`].
#[derive(Debug, Clone)]
pub enum AuthorizeOutcome {
    Granted {
        resource: Resource,
        membership_id: MembershipId,
        policy_id: PolicyId,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    NotFound,
    Forbidden { violated_properties: Vec<String> },
}

/// Result of a [`ClientCache::recompute_connectable_resources`] pass.
#[derive(Debug, Default, Clone)]
pub struct RecomputeDiff {
    pub added: Vec<Resource>,
    pub removed: Vec<ResourceId>,
}

impl ClientCache {
    #[must_use]
    pub fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id: Some(actor_id),
            ..Self::default()
        }
    }

    /// Replace cache contents wholesale — called once on channel join
    /// with every non-disabled policy whose group contains the actor
    /// (including the synthesized "Everyone" group).
    pub fn hydrate(
        &mut self,
        policies: impl IntoIterator<Item = Policy>,
        resources: impl IntoIterator<Item = Resource>,
        memberships: impl IntoIterator<Item = (ActorGroupId, Option<MembershipId>)>,
    ) {
        self.policies.clear();
        self.resources.clear();
        self.memberships.clear();
        self.connectable_resources.clear();
        for policy in policies {
            self.policies.insert(policy.id, policy);
        }
        for resource in resources {
            self.resources.insert(resource.id, resource);
        }
        for (group_id, membership_id) in memberships {
            self.memberships.insert(group_id, membership_id);
        }
    }

    #[must_use]
    pub fn connectable_resources(&self) -> Vec<&Resource> {
        self.connectable_resources.values().collect()
    }

    #[must_use]
    pub fn membership_for(&self, group_id: ActorGroupId) -> Option<MembershipId> {
        self.memberships.get(&group_id).copied().flatten()
    }

    fn policies_for_resource<'a>(&'a self, resource_id: ResourceId) -> impl Iterator<Item = &'a Policy> + 'a {
        self.policies
            .values()
            .filter(move |p| p.resource_id == resource_id && p.is_active())
    }

    /// Select the longest-conforming policy for `resource_id` (spec §3
    /// invariant 3, §4.6). Requires the resource to already be present
    /// in `connectable_resources` (i.e. it passed §3 invariant 4).
    #[must_use]
    pub fn authorize_resource(
        &self,
        resource_id: ResourceId,
        ctx: &EvaluationContext<'_>,
    ) -> AuthorizeOutcome {
        let Some(resource) = self.connectable_resources.get(&resource_id) else {
            return AuthorizeOutcome::NotFound;
        };

        let candidates = self.policies_for_resource(resource_id).map(|policy| Candidate {
            policy,
            decision: fold_token_expiry(
                evaluate(&policy.conditions, ctx).unwrap_or(crate::policy::Decision::Forbidden {
                    violated_properties: vec!["malformed_condition".to_string()],
                }),
                ctx.token_expires_at,
            ),
        });

        match longest_conforming(candidates) {
            Outcome::Granted { policy_id, expires_at } => {
                let Some(policy) = self.policies.get(&policy_id) else {
                    return AuthorizeOutcome::NotFound;
                };
                let Some(membership_id) = self.membership_for(policy.actor_group_id) else {
                    return AuthorizeOutcome::NotFound;
                };
                AuthorizeOutcome::Granted {
                    resource: resource.clone(),
                    membership_id,
                    policy_id,
                    expires_at,
                }
            }
            Outcome::Forbidden { violated_properties } => {
                AuthorizeOutcome::Forbidden { violated_properties }
            }
            Outcome::NoPolicies => AuthorizeOutcome::NotFound,
        }
    }

    /// Filter cached policies by conformance, adapt surviving resources
    /// to the client's protocol version, and keep only those with a
    /// site (spec §3 invariant 4). `toggle_resource`, when set, forces
    /// that resource into both `added` and `removed` so an
    /// old client that can't move a resource's site in place performs
    /// delete-then-create instead.
    pub fn recompute_connectable_resources(
        &mut self,
        ctx: &EvaluationContext<'_>,
        client_version: ProtocolVersion,
        toggle_resource: Option<ResourceId>,
    ) -> RecomputeDiff {
        let mut new_set: HashMap<ResourceId, Resource> = HashMap::new();

        let mut conforming_resource_ids: Vec<ResourceId> = Vec::new();
        for policy in self.policies.values().filter(|p| p.is_active()) {
            if self.membership_for(policy.actor_group_id).is_none() {
                continue;
            }
            match evaluate(&policy.conditions, ctx) {
                Ok(crate::policy::Decision::Ok { .. }) => {
                    conforming_resource_ids.push(policy.resource_id);
                }
                _ => continue,
            }
        }

        for resource_id in conforming_resource_ids {
            let Some(resource) = self.resources.get(&resource_id) else {
                tracing::warn!(%resource_id, "policy references resource missing from cache");
                continue;
            };
            if !resource.has_site() {
                continue;
            }
            if resource.resource_type == ResourceType::Internet
                && !client_supports_internet_resource(client_version)
            {
                continue;
            }
            new_set.insert(resource_id, resource.clone());
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();

        for (id, resource) in &new_set {
            if !self.connectable_resources.contains_key(id) {
                added.push(resource.clone());
            }
        }
        for id in self.connectable_resources.keys() {
            if !new_set.contains_key(id) {
                removed.push(*id);
            }
        }

        if let Some(toggled) = toggle_resource {
            if let Some(resource) = new_set.get(&toggled) {
                if !added.iter().any(|r| r.id == toggled) {
                    added.push(resource.clone());
                }
                if !removed.contains(&toggled) {
                    removed.push(toggled);
                }
            }
        }

        self.connectable_resources = new_set;
        RecomputeDiff { added, removed }
    }

    /// Insert a membership. The caller is responsible for fetching any
    /// newly-visible policies/resources and re-hydrating them via
    /// [`Self::add_policy`] before calling `recompute`.
    pub fn add_membership(&mut self, group_id: ActorGroupId, membership_id: MembershipId) {
        self.memberships.insert(group_id, Some(membership_id));
    }

    /// Drop a membership. Policies for the group stay cached (other
    /// members may still need them via a different channel) but no
    /// longer conform for this client once `recompute` runs again,
    /// since [`Self::membership_for`] will return `None`.
    pub fn delete_membership(&mut self, group_id: ActorGroupId) {
        self.memberships.remove(&group_id);
    }

    /// Insert or replace a cached policy. `resource` must be supplied
    /// when the policy references a resource not already cached — the
    /// cache never performs I/O itself (spec §4.4 failure semantics:
    /// "database errors during on-demand resource fetch abort the
    /// mutation and leave the cache unchanged").
    pub fn add_policy(&mut self, policy: Policy, resource: Option<Resource>) -> Result<(), PolicyResourceMissing> {
        if !self.resources.contains_key(&policy.resource_id) {
            match resource {
                Some(resource) => {
                    self.resources.insert(resource.id, resource);
                }
                None => return Err(PolicyResourceMissing(policy.resource_id)),
            }
        }
        self.policies.insert(policy.id, policy);
        Ok(())
    }

    pub fn update_policy(&mut self, policy: Policy, resource: Option<Resource>) -> Result<(), PolicyResourceMissing> {
        self.add_policy(policy, resource)
    }

    /// Remove a policy; if no other cached policy references its
    /// resource, drop the resource too and report it so the caller can
    /// evict it from `connectable_resources` on the next recompute.
    pub fn delete_policy(&mut self, policy_id: PolicyId) -> Option<ResourceId> {
        let policy = self.policies.remove(&policy_id)?;
        let still_referenced = self
            .policies
            .values()
            .any(|p| p.resource_id == policy.resource_id);
        if !still_referenced {
            self.resources.remove(&policy.resource_id);
            self.connectable_resources.remove(&policy.resource_id);
            Some(policy.resource_id)
        } else {
            None
        }
    }

    /// Update the denormalized site name on every cached resource whose
    /// `site_id` matches. Returns the ids whose wire-visible name
    /// actually changed, so the caller can force a toggle recompute for
    /// clients below [`crate::transport::version::CLIENT_IN_PLACE_SITE_UPDATE_MIN_VERSION`].
    pub fn update_resources_with_site_name(&mut self, site_id: SiteId, new_name: &str) -> Vec<ResourceId> {
        let previous = self.site_names.insert(site_id, new_name.to_string());
        if previous.as_deref() == Some(new_name) {
            return Vec::new();
        }
        self.resources
            .values()
            .filter(|r| r.site_id == Some(site_id))
            .map(|r| r.id)
            .collect()
    }

    #[must_use]
    pub fn site_name(&self, site_id: SiteId) -> Option<&str> {
        self.site_names.get(&site_id).map(String::as_str)
    }

    #[must_use]
    pub fn actor_id(&self) -> Option<ActorId> {
        self.actor_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("policy references uncached resource {0}")]
pub struct PolicyResourceMissing(pub ResourceId);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, ActorGroupId, Client, ClientId, SiteId};
    use chrono::Utc;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use uuid::Uuid;

    fn client() -> Client {
        Client {
            id: ClientId::new(Uuid::nil()),
            account_id: AccountId::new(Uuid::nil()),
            actor_id: ActorId::new(Uuid::nil()),
            external_id: "e".into(),
            public_key: "x".repeat(44),
            ipv4: Ipv4Addr::new(100, 64, 0, 1),
            ipv6: Ipv6Addr::LOCALHOST,
            last_seen_user_agent: None,
            last_seen_version: "1.4.0".into(),
            verified_at: None,
            deleted_at: None,
        }
    }

    fn ctx(client: &Client) -> EvaluationContext<'_> {
        EvaluationContext {
            client,
            auth_provider_id: None,
            remote_ip: None,
            remote_ip_region: None,
            now: Utc::now(),
            token_expires_at: None,
        }
    }

    fn resource(site: Option<SiteId>) -> Resource {
        Resource {
            id: ResourceId::new(Uuid::new_v4()),
            account_id: AccountId::new(Uuid::nil()),
            site_id: site,
            resource_type: ResourceType::Dns,
            address: "db.internal".into(),
            address_description: None,
            ip_stack: Some(crate::domain::IpStack::Dual),
            filters: vec![],
            deleted_at: None,
        }
    }

    fn policy(resource_id: ResourceId, group: ActorGroupId) -> Policy {
        Policy {
            id: PolicyId::new(Uuid::new_v4()),
            account_id: AccountId::new(Uuid::nil()),
            actor_group_id: group,
            resource_id,
            conditions: vec![],
            disabled_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn membership_without_matching_policy_yields_no_connectables() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let c = client();
        let diff = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), None);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn add_membership_enables_resource_scenario_1() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let group = ActorGroupId::new(Uuid::new_v4());
        let r = resource(Some(SiteId::new(Uuid::new_v4())));
        let p = policy(r.id, group);
        cache.add_policy(p.clone(), Some(r.clone())).unwrap();

        let c = client();
        let before = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), None);
        assert!(before.added.is_empty());

        cache.add_membership(group, MembershipId::new(Uuid::new_v4()));
        let after = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), None);
        assert_eq!(after.added.len(), 1);
        assert_eq!(after.added[0].id, r.id);
    }

    #[test]
    fn resource_without_site_never_becomes_connectable() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let group = ActorGroupId::new(Uuid::new_v4());
        let r = resource(None);
        let p = policy(r.id, group);
        cache.add_policy(p, Some(r)).unwrap();
        cache.add_membership(group, MembershipId::new(Uuid::new_v4()));

        let c = client();
        let diff = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), None);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn delete_policy_drops_resource_when_unreferenced() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let group = ActorGroupId::new(Uuid::new_v4());
        let r = resource(Some(SiteId::new(Uuid::new_v4())));
        let p = policy(r.id, group);
        cache.add_policy(p.clone(), Some(r.clone())).unwrap();

        let dropped = cache.delete_policy(p.id);
        assert_eq!(dropped, Some(r.id));
    }

    #[test]
    fn toggle_forces_resource_into_both_added_and_removed() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let group = ActorGroupId::new(Uuid::new_v4());
        let r = resource(Some(SiteId::new(Uuid::new_v4())));
        let p = policy(r.id, group);
        cache.add_policy(p, Some(r.clone())).unwrap();
        cache.add_membership(group, MembershipId::new(Uuid::new_v4()));

        let c = client();
        let diff = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), Some(r.id));
        assert!(diff.added.iter().any(|res| res.id == r.id));
        assert!(diff.removed.contains(&r.id));
    }

    #[test]
    fn token_expiry_shortens_an_otherwise_unbounded_grant() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let group = ActorGroupId::new(Uuid::new_v4());
        let r = resource(Some(SiteId::new(Uuid::new_v4())));
        let p = policy(r.id, group);
        cache.add_policy(p.clone(), Some(r.clone())).unwrap();
        cache.add_membership(group, MembershipId::new(Uuid::new_v4()));

        let c = client();
        cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), None);

        let token_expiry = Utc::now() + chrono::Duration::minutes(5);
        let mut bounded = ctx(&c);
        bounded.token_expires_at = Some(token_expiry);

        match cache.authorize_resource(r.id, &bounded) {
            AuthorizeOutcome::Granted { expires_at, .. } => {
                assert_eq!(expires_at, Some(token_expiry));
            }
            other => panic!("expected a grant, got {other:?}"),
        }
    }

    #[test]
    fn internet_resource_filtered_for_old_clients() {
        let mut cache = ClientCache::new(ActorId::new(Uuid::nil()));
        let group = ActorGroupId::new(Uuid::new_v4());
        let mut r = resource(Some(SiteId::new(Uuid::new_v4())));
        r.resource_type = ResourceType::Internet;
        let p = policy(r.id, group);
        cache.add_policy(p, Some(r.clone())).unwrap();
        cache.add_membership(group, MembershipId::new(Uuid::new_v4()));

        let c = client();
        let diff = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 2, 0), None);
        assert!(diff.added.is_empty());

        let diff_new = cache.recompute_connectable_resources(&ctx(&c), ProtocolVersion::new(1, 4, 0), None);
        assert_eq!(diff_new.added.len(), 1);
    }
}
