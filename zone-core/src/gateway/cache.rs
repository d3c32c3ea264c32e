//! Per-gateway flow cache (spec §4.5).
//!
//! One instance lives inside each gateway channel task; only that task
//! ever mutates it (spec §5 "per-process caches are private").

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::{ClientId, FlowId, GatewayId, ResourceId};
use crate::policy::{evaluate, fold_token_expiry, longest_conforming, Candidate, EvaluationContext, Outcome};
use crate::domain::Policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientResourcePair {
    pub client_id: ClientId,
    pub resource_id: ResourceId,
}

#[derive(Debug, Default)]
pub struct GatewayCache {
    gateway_id: Option<GatewayId>,
    /// `(client, resource) -> flow_id -> expires_at` (unix seconds).
    flows: HashMap<ClientResourcePair, HashMap<FlowId, i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReauthorizeOutcome {
    Ok { expires_at: i64 },
    Unauthorized,
    NotFound,
}

impl GatewayCache {
    #[must_use]
    pub fn new(gateway_id: GatewayId) -> Self {
        Self {
            gateway_id: Some(gateway_id),
            flows: HashMap::new(),
        }
    }

    /// Replace the cache contents wholesale — called once on hydration
    /// from the database's currently-active flows for this gateway.
    pub fn hydrate(&mut self, entries: impl IntoIterator<Item = (ClientId, ResourceId, FlowId, i64)>) {
        self.flows.clear();
        for (client_id, resource_id, flow_id, expires_at) in entries {
            self.put(client_id, resource_id, flow_id, expires_at);
        }
    }

    /// Drop expired flow entries and any outer key left with no flows.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let now_unix = now.timestamp();
        self.flows.retain(|_, inner| {
            inner.retain(|_, expires_at| *expires_at > now_unix);
            !inner.is_empty()
        });
    }

    /// Additive insert; never displaces an existing flow for the pair.
    pub fn put(&mut self, client_id: ClientId, resource_id: ResourceId, flow_id: FlowId, expires_at: i64) {
        self.flows
            .entry(ClientResourcePair { client_id, resource_id })
            .or_default()
            .insert(flow_id, expires_at);
    }

    /// The latest expiration among all flows for a pair, if any.
    #[must_use]
    pub fn get(&self, client_id: ClientId, resource_id: ResourceId) -> Option<i64> {
        self.flows
            .get(&ClientResourcePair { client_id, resource_id })
            .and_then(|inner| inner.values().copied().max())
    }

    #[must_use]
    pub fn has_resource(&self, resource_id: ResourceId) -> bool {
        self.flows.keys().any(|pair| pair.resource_id == resource_id)
    }

    #[must_use]
    pub fn all_pairs_for_resource(&self, resource_id: ResourceId) -> Vec<ClientResourcePair> {
        self.flows
            .keys()
            .filter(|pair| pair.resource_id == resource_id)
            .copied()
            .collect()
    }

    /// Remove `flow_id` from the pair's entry. If other flows remain,
    /// returns their max expiry. Otherwise attempts to reauthorize
    /// against the currently-cached policies for the pair's actor;
    /// on success inserts a fresh flow, on failure drops the outer key
    /// and tells the caller to instruct the gateway to drop access.
    #[allow(clippy::too_many_arguments)]
    pub fn reauthorize_deleted_flow(
        &mut self,
        client_id: ClientId,
        resource_id: ResourceId,
        flow_id: FlowId,
        candidate_policies: &[Policy],
        eval_ctx: &EvaluationContext<'_>,
        new_flow_id: impl FnOnce() -> FlowId,
        now: DateTime<Utc>,
    ) -> ReauthorizeOutcome {
        let pair = ClientResourcePair { client_id, resource_id };
        let Some(inner) = self.flows.get_mut(&pair) else {
            return ReauthorizeOutcome::NotFound;
        };
        if inner.remove(&flow_id).is_none() {
            return ReauthorizeOutcome::NotFound;
        }
        if let Some(max) = inner.values().copied().max() {
            return ReauthorizeOutcome::Ok { expires_at: max };
        }

        // No flows remain for this pair; re-run the evaluator.
        self.flows.remove(&pair);

        let candidates = candidate_policies
            .iter()
            .filter(|p| p.resource_id == resource_id && p.is_active())
            .map(|policy| Candidate {
                policy,
                decision: fold_token_expiry(
                    evaluate(&policy.conditions, eval_ctx).unwrap_or(crate::policy::Decision::Forbidden {
                        violated_properties: vec!["malformed_condition".to_string()],
                    }),
                    eval_ctx.token_expires_at,
                ),
            });

        match longest_conforming(candidates) {
            Outcome::Granted { expires_at, .. } => {
                let expiry_unix = expires_at.map_or(i64::MAX, |e| e.timestamp());
                let flow_id = new_flow_id();
                self.put(client_id, resource_id, flow_id, expiry_unix);
                let _ = now;
                ReauthorizeOutcome::Ok { expires_at: expiry_unix }
            }
            Outcome::Forbidden { .. } | Outcome::NoPolicies => ReauthorizeOutcome::Unauthorized,
        }
    }

    #[must_use]
    pub fn gateway_id(&self) -> Option<GatewayId> {
        self.gateway_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids() -> (ClientId, ResourceId, FlowId) {
        (
            ClientId::new(Uuid::new_v4()),
            ResourceId::new(Uuid::new_v4()),
            FlowId::new(Uuid::new_v4()),
        )
    }

    #[test]
    fn put_then_get_returns_max_expiry() {
        let mut cache = GatewayCache::new(GatewayId::new(Uuid::new_v4()));
        let (client, resource, flow1) = ids();
        let flow2 = FlowId::new(Uuid::new_v4());
        cache.put(client, resource, flow1, 100);
        cache.put(client, resource, flow2, 200);
        assert_eq!(cache.get(client, resource), Some(200));
    }

    #[test]
    fn prune_drops_expired_and_empties_outer_key() {
        let mut cache = GatewayCache::new(GatewayId::new(Uuid::new_v4()));
        let (client, resource, flow1) = ids();
        let now = Utc::now();
        cache.put(client, resource, flow1, now.timestamp() - 10);
        cache.prune(now);
        assert_eq!(cache.get(client, resource), None);
        assert!(!cache.has_resource(resource));
    }

    #[test]
    fn reauthorize_returns_remaining_max_when_other_flows_exist() {
        let mut cache = GatewayCache::new(GatewayId::new(Uuid::new_v4()));
        let (client, resource, flow1) = ids();
        let flow2 = FlowId::new(Uuid::new_v4());
        cache.put(client, resource, flow1, 100);
        cache.put(client, resource, flow2, 300);

        let outcome = cache.reauthorize_deleted_flow(
            client,
            resource,
            flow1,
            &[],
            &dummy_ctx(),
            || FlowId::new(Uuid::new_v4()),
            Utc::now(),
        );
        assert_eq!(outcome, ReauthorizeOutcome::Ok { expires_at: 300 });
    }

    #[test]
    fn reauthorize_not_found_for_missing_flow() {
        let mut cache = GatewayCache::new(GatewayId::new(Uuid::new_v4()));
        let (client, resource, flow1) = ids();
        let outcome = cache.reauthorize_deleted_flow(
            client,
            resource,
            flow1,
            &[],
            &dummy_ctx(),
            || FlowId::new(Uuid::new_v4()),
            Utc::now(),
        );
        assert_eq!(outcome, ReauthorizeOutcome::NotFound);
    }

    fn dummy_ctx() -> EvaluationContext<'static> {
        use crate::domain::{AccountId, ActorId};
        use std::net::{Ipv4Addr, Ipv6Addr};
        let client: &'static crate::domain::Client = Box::leak(Box::new(crate::domain::Client {
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
        }));
        EvaluationContext {
            client,
            auth_provider_id: None,
            remote_ip: None,
            remote_ip_region: None,
            now: Utc::now(),
            token_expires_at: None,
        }
    }
}
