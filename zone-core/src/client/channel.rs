//! Per-client-connection actor (spec §4.4, §5).
//!
//! One [`ClientChannel`] per connected client socket, built on the same
//! spawn/`mutate_on`/`act_on` shape as [`crate::gateway::channel::GatewayChannel`].
//! The transport layer owns turning `ServerToClient` values into
//! WebSocket frames; this actor only ever produces those values.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use acton_reactive::prelude::*;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::{
    AccountId, ActorGroupId, ActorId, AuthProviderId, Client, ClientId, GatewayGroupId,
    MembershipId, Policy, Resource, ResourceId,
};
use crate::gateway::channel::PushAuthorizeFlow;
use crate::gateway::rendezvous::{build_authorize_flow, rewrite_resource_for_version, RendezvousRequest};
use crate::policy::EvaluationContext;
use crate::presence::{derive_credential, select_relays, SharedPresence};
use crate::transport::messages::{IceCredentials, Interface, RelayCredential, ResourceWire, ServerToClient, ServerToGateway};
use crate::transport::registry::ChannelRegistry;
use crate::transport::version::{client_supports_in_place_site_update, ProtocolVersion};
use crate::pubsub::{DomainEvent, PubSub, SubscriberId, Topic};

use super::cache::{AuthorizeOutcome, ClientCache, RecomputeDiff};

pub struct ClientChannelState {
    pub client_id: ClientId,
    pub actor_id: ActorId,
    pub account_id: AccountId,
    pub version: ProtocolVersion,
    pub cache: ClientCache,
    pub last_applied_lsn: u64,
    pub outbound: mpsc::UnboundedSender<ServerToClient>,
    pub pubsub: PubSub,
    pub presence: SharedPresence,
    pub account_subscriber: Option<SubscriberId>,
    pub socket_subscriber: Option<SubscriberId>,
    /// One `actor_group:<id>/policies` subscription per group this
    /// client currently belongs to, so `allow_access`/`reject_access`
    /// pushes reach it as memberships change (spec §4.3).
    pub group_subscribers: HashMap<ActorGroupId, SubscriberId>,
    /// The client's own record, refreshed from `DomainEvent::Client` updates.
    /// Needed to build an [`EvaluationContext`] on every `prepare_connection`.
    pub client: Option<Client>,
    pub registry: ChannelRegistry,
    /// HMAC key for rendezvous `ref`s; `None` disables `prepare_connection`
    /// rather than signing with a guessed key.
    pub signing_key: Option<Arc<Vec<u8>>>,
    /// Expiration carried by the client's own auth token (spec §3:
    /// effective policy expiration is `min(condition_expires_at,
    /// token_expires_at)`), refreshed on hydration.
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Sent by the socket transport when the client sends `prepare_connection`
/// or `reuse_connection` (spec §6). `reuse_connection` differs only in
/// that the caller already names a `gateway_id`; both end up authorizing
/// against the cache and pushing `authorize_flow` to a gateway channel.
#[derive(Clone, Debug)]
pub struct RequestPrepareConnection {
    pub resource_id: ResourceId,
    pub preferred_gateway_id: Option<crate::domain::GatewayId>,
    pub auth_provider_id: Option<AuthProviderId>,
    pub remote_ip: Option<IpAddr>,
    pub remote_ip_region: Option<String>,
}

/// Sent once by the socket handler right after `spawn`, carrying
/// everything a cold-started cache needs plus what the `init` frame
/// (spec §6) reports back to the client.
#[derive(Clone, Debug)]
pub struct HydrateCache {
    pub account_slug: String,
    pub policies: Vec<Policy>,
    pub resources: Vec<Resource>,
    pub memberships: Vec<(ActorGroupId, Option<MembershipId>)>,
    pub relays: Vec<RelayCredential>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Sent by a gateway channel once it has decoded a `flow_authorized` ref
/// naming this client channel (spec §4.5 step 4).
#[derive(Clone, Debug)]
pub struct PushConnect {
    pub gateway_public_key: String,
    pub gateway_ipv4: std::net::Ipv4Addr,
    pub gateway_ipv6: std::net::Ipv6Addr,
    pub preshared_key: String,
    pub ice_credentials: IceCredentials,
}

/// `acton_reactive::AgentRuntime::new_agent` requires `Default`; every
/// field below is immediately overwritten in [`ClientChannel::spawn`],
/// this just has to type-check. The throwaway sender's receiver is
/// dropped, so anything sent before `spawn` overwrites it is silently lost.
impl Default for ClientChannelState {
    fn default() -> Self {
        let (outbound, _rx) = mpsc::unbounded_channel();
        Self {
            client_id: ClientId::new(uuid::Uuid::nil()),
            actor_id: ActorId::new(uuid::Uuid::nil()),
            account_id: AccountId::new(uuid::Uuid::nil()),
            version: ProtocolVersion::new(0, 0, 0),
            cache: ClientCache::default(),
            last_applied_lsn: 0,
            outbound,
            pubsub: PubSub::default(),
            presence: SharedPresence::default(),
            account_subscriber: None,
            socket_subscriber: None,
            group_subscribers: HashMap::new(),
            client: None,
            registry: ChannelRegistry::default(),
            signing_key: None,
            token_expires_at: None,
        }
    }
}

impl std::fmt::Debug for ClientChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannelState")
            .field("client_id", &self.client_id)
            .field("last_applied_lsn", &self.last_applied_lsn)
            .finish()
    }
}

#[derive(Clone, Debug)]
struct ApplyDomainEvent(DomainEvent);

pub struct ClientChannel;

/// Built once from the socket's last-known remote address / auth
/// context and refreshed whenever those change; not stored in
/// [`ClientChannelState`] since it borrows the live [`Client`] record.
pub struct AuthorizeRequest<'a> {
    pub resource_id: ResourceId,
    pub ctx: EvaluationContext<'a>,
}

impl ClientChannel {
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        runtime: &mut AgentRuntime,
        client: &Client,
        version: ProtocolVersion,
        outbound: mpsc::UnboundedSender<ServerToClient>,
        pubsub: PubSub,
        presence: SharedPresence,
        registry: ChannelRegistry,
        signing_key: Option<Arc<Vec<u8>>>,
    ) -> anyhow::Result<AgentHandle> {
        let mut agent = runtime.new_agent::<ClientChannelState>();

        agent.model.client_id = client.id;
        agent.model.actor_id = client.actor_id;
        agent.model.account_id = client.account_id;
        agent.model.version = version;
        agent.model.cache = ClientCache::new(client.actor_id);
        agent.model.last_applied_lsn = 0;
        agent.model.outbound = outbound;
        agent.model.pubsub = pubsub;
        agent.model.presence = presence;
        agent.model.account_subscriber = None;
        agent.model.socket_subscriber = None;
        agent.model.group_subscribers = HashMap::new();
        agent.model.client = Some(client.clone());
        agent.model.registry = registry;
        agent.model.signing_key = signing_key;
        agent.model.token_expires_at = None;

        agent.mutate_on::<ApplyDomainEvent>(|agent, envelope| {
            let event = envelope.message().0.clone();
            if let Some(lsn) = event.lsn() {
                if lsn <= agent.model.last_applied_lsn {
                    return Reply::ready();
                }
                agent.model.last_applied_lsn = lsn;
            }
            apply_event(&mut agent.model, event);
            Reply::ready()
        });

        agent.mutate_on::<HydrateCache>(|agent, envelope| {
            let msg = envelope.message().clone();
            let groups: Vec<ActorGroupId> = msg.memberships.iter().map(|(g, _)| *g).collect();
            agent
                .model
                .cache
                .hydrate(msg.policies, msg.resources, msg.memberships);
            agent.model.token_expires_at = msg.token_expires_at;

            for group_id in groups {
                subscribe_to_group(&mut agent.model, group_id, agent.handle().clone());
            }

            let Some(client) = agent.model.client.clone() else {
                return Reply::ready();
            };
            let ctx = EvaluationContext {
                client: &client,
                auth_provider_id: None,
                remote_ip: None,
                remote_ip_region: None,
                now: Utc::now(),
                token_expires_at: agent.model.token_expires_at,
            };
            let diff = agent
                .model
                .cache
                .recompute_connectable_resources(&ctx, agent.model.version, None);
            let resources = diff
                .added
                .iter()
                .map(|r| to_wire(&agent.model, r))
                .collect();

            let _ = agent.model.outbound.send(ServerToClient::Init {
                account_slug: msg.account_slug,
                interface: Interface { ipv4: client.ipv4, ipv6: client.ipv6 },
                resources,
                relays: msg.relays,
            });
            Reply::ready()
        });

        agent.mutate_on::<PushConnect>(|agent, envelope| {
            let push = envelope.message().clone();
            let _ = agent.model.outbound.send(ServerToClient::Connect {
                gateway_public_key: push.gateway_public_key,
                gateway_ipv4: push.gateway_ipv4,
                gateway_ipv6: push.gateway_ipv6,
                preshared_key: push.preshared_key,
                ice_credentials: push.ice_credentials,
            });
            Reply::ready()
        });

        agent.act_on::<RequestPrepareConnection>(|agent, envelope| {
            let request = envelope.message().clone();

            let Some(client) = agent.model.client.clone() else {
                tracing::warn!("prepare_connection before client record hydrated");
                return Reply::ready();
            };
            let Some(signing_key) = agent.model.signing_key.clone() else {
                tracing::warn!("prepare_connection: no rendezvous signing key configured");
                return Reply::ready();
            };

            let ctx = EvaluationContext {
                client: &client,
                auth_provider_id: request.auth_provider_id,
                remote_ip: request.remote_ip,
                remote_ip_region: request.remote_ip_region.clone(),
                now: Utc::now(),
                token_expires_at: agent.model.token_expires_at,
            };
            let outcome = authorize_resource(
                &agent.model,
                AuthorizeRequest { resource_id: request.resource_id, ctx },
            );

            let AuthorizeOutcome::Granted { resource, expires_at, .. } = outcome else {
                return Reply::ready();
            };

            let Some(site_id) = resource.site_id else {
                return Reply::ready();
            };
            let group_id = GatewayGroupId::new(site_id.into_inner());
            let mut candidates = agent.model.presence.online_gateways(group_id);
            if let Some(preferred) = request.preferred_gateway_id {
                if let Some(pos) = candidates.iter().position(|g| g.gateway_id == preferred) {
                    candidates.swap(0, pos);
                }
            }
            let Some(gateway) = candidates.into_iter().next() else {
                tracing::warn!(resource_id = %request.resource_id, "no online gateway for resource's site");
                return Reply::ready();
            };
            let Some(gateway_handle) = agent.model.registry.gateway(gateway.gateway_id) else {
                tracing::warn!(gateway_id = %gateway.gateway_id, "gateway presence entry has no live channel");
                return Reply::ready();
            };

            let resource_wire = to_wire(&agent.model, &resource);
            let resource_wire = rewrite_resource_for_version(resource_wire, resource.resource_type, gateway_version_hint());
            let ice_credentials = IceCredentials { ufrag: random_token(8), pwd: random_token(24) };
            let rendezvous = RendezvousRequest {
                client_id: agent.model.client_id,
                client_public_key: client.public_key.clone(),
                resource: resource_wire,
                resource_type: resource.resource_type,
                preshared_key: random_token(32),
                ice_credentials,
                expires_at,
            };
            let message = build_authorize_flow(&signing_key, rendezvous);

            Reply::pending(async move {
                gateway_handle.send(PushAuthorizeFlow(message)).await;
            })
        });

        agent.after_start(|agent| {
            let topic = Topic::account(agent.model.account_id);
            let (id, mut rx) = agent.model.pubsub.subscribe(&topic);
            agent.model.account_subscriber = Some(id);

            let handle = agent.handle().clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    handle.send(ApplyDomainEvent(event)).await;
                }
            });

            let socket_topic = Topic::socket(&agent.model.client_id.to_string());
            let (socket_id, mut socket_rx) = agent.model.pubsub.subscribe(&socket_topic);
            agent.model.socket_subscriber = Some(socket_id);

            let handle = agent.handle().clone();
            tokio::spawn(async move {
                while let Some(event) = socket_rx.recv().await {
                    handle.send(ApplyDomainEvent(event)).await;
                }
            });

            agent.model.registry.register_client(agent.model.client_id, agent.handle().clone());

            tracing::info!(client_id = %agent.model.client_id, "client channel joined");
            Reply::ready()
        });

        agent.before_stop(|agent| {
            if let Some(id) = agent.model.account_subscriber {
                agent
                    .model
                    .pubsub
                    .unsubscribe(&Topic::account(agent.model.account_id), id);
            }
            if let Some(id) = agent.model.socket_subscriber {
                agent
                    .model
                    .pubsub
                    .unsubscribe(&Topic::socket(&agent.model.client_id.to_string()), id);
            }
            for (group_id, id) in agent.model.group_subscribers.drain().collect::<Vec<_>>() {
                agent
                    .model
                    .pubsub
                    .unsubscribe(&Topic::actor_group_policies(group_id), id);
            }
            agent.model.registry.unregister_client(agent.model.client_id);
            tracing::info!(client_id = %agent.model.client_id, "client channel closing");
            Reply::ready()
        });

        let handle = agent.start().await;
        Ok(handle)
    }
}

/// `build_authorize_flow`'s legacy IP-collapse rewrite is keyed on the
/// *gateway's* protocol version, which the client channel doesn't track
/// per gateway today; assume modern gateways until gateway presence
/// carries a version field.
fn gateway_version_hint() -> ProtocolVersion {
    ProtocolVersion::new(1, 4, 0)
}

/// Generate a URL-safe random token for preshared keys / ICE credentials.
/// Not cryptographic framing beyond "unguessable" — the same role the
/// teacher's session/token modules use `rand` for elsewhere in this crate.
fn random_token(len: usize) -> String {
    use rand::distr::{Alphanumeric, SampleString};
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

/// Translate a domain change event into cache mutations and the
/// resulting push(es) to the client socket (spec §4.4 state machine).
fn apply_event(state: &mut ClientChannelState, event: DomainEvent) {
    match event {
        DomainEvent::Resource(change) => {
            if let Some(new) = &change.new {
                if state.cache.connectable_resources().iter().any(|r| r.id == new.id) {
                    push_resource_updated(state, new);
                }
            }
        }
        DomainEvent::Site(change) => {
            if let Some(site) = &change.new {
                let changed = state.cache.update_resources_with_site_name(site.id, &site.name);
                if !changed.is_empty() {
                    let needs_toggle = !client_supports_in_place_site_update(state.version);
                    for resource_id in changed {
                        let resource = state
                            .cache
                            .connectable_resources()
                            .into_iter()
                            .find(|r| r.id == resource_id)
                            .cloned();
                        let Some(resource) = resource else { continue };
                        if needs_toggle {
                            push_resource_deleted(state, resource_id);
                        }
                        push_resource_updated(state, &resource);
                    }
                }
            }
        }
        DomainEvent::Client(change) => {
            if let Some(new) = &change.new {
                if new.id == state.client_id {
                    state.client = Some(new.clone());
                }
            }
        }
        DomainEvent::Account(change) => {
            if let (Some(old), Some(new)) = (&change.old, &change.new) {
                if old.slug != new.slug {
                    let _ = state.outbound.send(ServerToClient::ConfigChanged);
                }
            }
        }
        DomainEvent::Membership(change) => {
            let membership = change.latest();
            if membership.actor_id != state.actor_id {
                return;
            }
            let group_id = membership.group_id;
            let membership_id = membership.id;
            match change.op {
                crate::pubsub::ChangeOp::Insert | crate::pubsub::ChangeOp::Update => {
                    state.cache.add_membership(group_id, membership_id);
                    if let Some(handle) = state.registry.client(state.client_id) {
                        subscribe_to_group(state, group_id, handle);
                    }
                }
                crate::pubsub::ChangeOp::Delete => {
                    state.cache.delete_membership(group_id);
                    unsubscribe_from_group(state, group_id);
                }
            }
            let diff = recompute(state);
            push_recompute_diff(state, &diff);
        }
        DomainEvent::Policy(change) => {
            match change.op {
                crate::pubsub::ChangeOp::Insert | crate::pubsub::ChangeOp::Update => {
                    let policy = change.latest().clone();
                    if let Err(err) = state.cache.add_policy(policy, None) {
                        tracing::warn!(%err, "policy add/update: resource not cached, dropping");
                        return;
                    }
                }
                crate::pubsub::ChangeOp::Delete => {
                    let policy = change.latest();
                    if let Some(resource_id) = state.cache.delete_policy(policy.id) {
                        push_resource_deleted(state, resource_id);
                    }
                }
            }
            let diff = recompute(state);
            push_recompute_diff(state, &diff);
        }
        DomainEvent::AllowAccess { .. } => {
            let diff = recompute(state);
            push_recompute_diff(state, &diff);
        }
        DomainEvent::RejectAccess { resource_id, .. } => {
            push_resource_deleted(state, resource_id);
        }
        DomainEvent::Disconnect => {
            let _ = state.outbound.send(ServerToClient::Disconnect {
                reason: "token revoked".to_string(),
            });
        }
        _ => {}
    }
}

fn push_resource_updated(state: &ClientChannelState, resource: &Resource) {
    let wire = to_wire(state, resource);
    let _ = state
        .outbound
        .send(ServerToClient::ResourceCreatedOrUpdated { resource: wire });
}

fn push_resource_deleted(state: &ClientChannelState, resource_id: ResourceId) {
    let _ = state
        .outbound
        .send(ServerToClient::ResourceDeleted { resource_id });
}

fn to_wire(state: &ClientChannelState, resource: &Resource) -> ResourceWire {
    let name = resource
        .site_id
        .and_then(|site| state.cache.site_name(site))
        .unwrap_or("")
        .to_string();
    ResourceWire {
        id: resource.id,
        resource_type: format!("{:?}", resource.resource_type).to_lowercase(),
        address: resource.address.clone(),
        address_description: resource.address_description.clone(),
        name,
    }
}

/// Re-run [`ClientCache::recompute_connectable_resources`] against the
/// channel's current client record and token expiry. Falls back to an
/// empty diff if the client record hasn't hydrated yet.
fn recompute(state: &mut ClientChannelState) -> RecomputeDiff {
    let Some(client) = state.client.clone() else {
        return RecomputeDiff::default();
    };
    let ctx = EvaluationContext {
        client: &client,
        auth_provider_id: None,
        remote_ip: None,
        remote_ip_region: None,
        now: Utc::now(),
        token_expires_at: state.token_expires_at,
    };
    state
        .cache
        .recompute_connectable_resources(&ctx, state.version, None)
}

/// Subscribe to a group's `actor_group:<id>/policies` topic once,
/// forwarding every event back to this channel's own mailbox. A no-op
/// if already subscribed.
fn subscribe_to_group(state: &mut ClientChannelState, group_id: ActorGroupId, handle: AgentHandle) {
    if state.group_subscribers.contains_key(&group_id) {
        return;
    }
    let topic = Topic::actor_group_policies(group_id);
    let (id, mut rx) = state.pubsub.subscribe(&topic);
    state.group_subscribers.insert(group_id, id);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle.send(ApplyDomainEvent(event)).await;
        }
    });
}

fn unsubscribe_from_group(state: &mut ClientChannelState, group_id: ActorGroupId) {
    if let Some(id) = state.group_subscribers.remove(&group_id) {
        state
            .pubsub
            .unsubscribe(&Topic::actor_group_policies(group_id), id);
    }
}

/// Push every resource in `diff` as the appropriate created/deleted
/// message. Called by the handler that drives `recompute` after a
/// membership/policy/resource mutation.
pub fn push_recompute_diff(state: &ClientChannelState, diff: &RecomputeDiff) {
    for resource in &diff.added {
        push_resource_updated(state, resource);
    }
    for resource_id in &diff.removed {
        push_resource_deleted(state, *resource_id);
    }
}

/// Drive [`ClientCache::authorize_resource`] and translate the outcome
/// to the socket-facing result the `prepare_connection` handler needs.
#[must_use]
pub fn authorize_resource(state: &ClientChannelState, req: AuthorizeRequest<'_>) -> AuthorizeOutcome {
    let outcome = state.cache.authorize_resource(req.resource_id, &req.ctx);
    if matches!(outcome, AuthorizeOutcome::NotFound) {
        tracing::warn!(
            client_id = %state.client_id,
            resource_id = %req.resource_id,
            "authorize_resource: not found (possible cache drift)"
        );
    }
    outcome
}

const _: fn() = || {
    fn assert_send<T: Send>() {}
    let _ = assert_send::<ClientChannelState>;
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AccountId, ActorGroupId, ClientId, IpStack, MembershipId, Policy, PolicyId, Resource,
        ResourceType, SiteId,
    };
    use crate::pubsub::{Change, ChangeOp};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use uuid::Uuid;

    fn state_with_client() -> (ClientChannelState, mpsc::UnboundedReceiver<ServerToClient>) {
        let mut state = ClientChannelState::default();
        let (tx, rx) = mpsc::unbounded_channel();
        state.client_id = ClientId::new(Uuid::new_v4());
        state.actor_id = ActorId::new(Uuid::new_v4());
        state.cache = ClientCache::new(state.actor_id);
        state.outbound = tx;
        state.client = Some(Client {
            id: state.client_id,
            account_id: AccountId::new(Uuid::new_v4()),
            actor_id: state.actor_id,
            external_id: "e".into(),
            public_key: "x".repeat(44),
            ipv4: Ipv4Addr::new(100, 64, 0, 1),
            ipv6: Ipv6Addr::LOCALHOST,
            last_seen_user_agent: None,
            last_seen_version: "1.4.0".into(),
            verified_at: None,
            deleted_at: None,
        });
        (state, rx)
    }

    fn resource(id: ResourceId, site: SiteId) -> Resource {
        Resource {
            id,
            account_id: AccountId::new(Uuid::new_v4()),
            site_id: Some(site),
            resource_type: ResourceType::Dns,
            address: "db.internal".into(),
            address_description: None,
            ip_stack: Some(IpStack::Dual),
            filters: vec![],
            deleted_at: None,
        }
    }

    fn policy(id: PolicyId, resource_id: ResourceId, group: ActorGroupId) -> Policy {
        Policy {
            id,
            account_id: AccountId::new(Uuid::new_v4()),
            actor_group_id: group,
            resource_id,
            conditions: vec![],
            disabled_at: None,
            deleted_at: None,
        }
    }

    fn membership(actor_id: ActorId, group_id: ActorGroupId) -> Membership {
        Membership {
            id: MembershipId::new(Uuid::new_v4()),
            account_id: AccountId::new(Uuid::new_v4()),
            actor_id,
            group_id,
            last_synced_at: None,
        }
    }

    #[test]
    fn membership_insert_for_this_actor_makes_its_resource_connectable() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let site_id = SiteId::new(Uuid::new_v4());
        let r = resource(resource_id, site_id);
        let p = policy(PolicyId::new(Uuid::new_v4()), resource_id, group_id);
        state.cache.add_policy(p, Some(r)).unwrap();

        apply_event(
            &mut state,
            DomainEvent::Membership(Change::insert(1, membership(state.actor_id, group_id))),
        );

        assert!(state.cache.membership_for(group_id).is_some());
        match rx.try_recv() {
            Ok(ServerToClient::ResourceCreatedOrUpdated { resource }) => {
                assert_eq!(resource.id, resource_id);
            }
            other => panic!("expected ResourceCreatedOrUpdated, got {other:?}"),
        }
    }

    #[test]
    fn membership_insert_for_a_different_actor_is_ignored() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let other_actor = ActorId::new(Uuid::new_v4());

        apply_event(
            &mut state,
            DomainEvent::Membership(Change::insert(1, membership(other_actor, group_id))),
        );

        assert!(state.cache.membership_for(group_id).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn membership_delete_drops_resource_from_connectable_set() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let site_id = SiteId::new(Uuid::new_v4());
        let r = resource(resource_id, site_id);
        let p = policy(PolicyId::new(Uuid::new_v4()), resource_id, group_id);
        state.cache.add_policy(p, Some(r)).unwrap();
        let m = membership(state.actor_id, group_id);
        apply_event(&mut state, DomainEvent::Membership(Change::insert(1, m.clone())));
        let _ = rx.try_recv();

        apply_event(&mut state, DomainEvent::Membership(Change::delete(2, m)));

        assert!(state.cache.membership_for(group_id).is_none());
        match rx.try_recv() {
            Ok(ServerToClient::ResourceDeleted { resource_id: deleted }) => {
                assert_eq!(deleted, resource_id);
            }
            other => panic!("expected ResourceDeleted, got {other:?}"),
        }
    }

    #[test]
    fn policy_insert_with_already_cached_resource_recomputes() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let site_id = SiteId::new(Uuid::new_v4());
        state.cache.add_membership(group_id, MembershipId::new(Uuid::new_v4()));
        let r = resource(resource_id, site_id);
        let stub_group = ActorGroupId::new(Uuid::new_v4());
        let stub_policy = policy(PolicyId::new(Uuid::new_v4()), resource_id, stub_group);
        state.cache.add_policy(stub_policy, Some(r)).unwrap();

        let p = policy(PolicyId::new(Uuid::new_v4()), resource_id, group_id);
        apply_event(&mut state, DomainEvent::Policy(Change::insert(1, p)));

        match rx.try_recv() {
            Ok(ServerToClient::ResourceCreatedOrUpdated { resource }) => {
                assert_eq!(resource.id, resource_id);
            }
            other => panic!("expected ResourceCreatedOrUpdated, got {other:?}"),
        }
    }

    #[test]
    fn policy_insert_for_an_uncached_resource_is_dropped_without_panicking() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let p = policy(PolicyId::new(Uuid::new_v4()), ResourceId::new(Uuid::new_v4()), group_id);

        apply_event(&mut state, DomainEvent::Policy(Change::insert(1, p)));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn policy_delete_pushes_resource_deleted_when_last_reference_dropped() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let site_id = SiteId::new(Uuid::new_v4());
        let r = resource(resource_id, site_id);
        let policy_id = PolicyId::new(Uuid::new_v4());
        let p = policy(policy_id, resource_id, group_id);
        state.cache.add_policy(p.clone(), Some(r)).unwrap();
        state.cache.add_membership(group_id, MembershipId::new(Uuid::new_v4()));
        apply_event(&mut state, DomainEvent::Policy(Change::insert(1, p.clone())));
        let _ = rx.try_recv();

        apply_event(&mut state, DomainEvent::Policy(Change::delete(2, p)));

        match rx.try_recv() {
            Ok(ServerToClient::ResourceDeleted { resource_id: deleted }) => {
                assert_eq!(deleted, resource_id);
            }
            other => panic!("expected ResourceDeleted, got {other:?}"),
        }
    }

    #[test]
    fn allow_access_triggers_a_recompute_push() {
        let (mut state, mut rx) = state_with_client();
        let group_id = ActorGroupId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let site_id = SiteId::new(Uuid::new_v4());
        let r = resource(resource_id, site_id);
        let policy_id = PolicyId::new(Uuid::new_v4());
        let p = policy(policy_id, resource_id, group_id);
        state.cache.add_policy(p, Some(r)).unwrap();
        state.cache.add_membership(group_id, MembershipId::new(Uuid::new_v4()));

        apply_event(
            &mut state,
            DomainEvent::AllowAccess { policy_id, actor_group_id: group_id },
        );

        match rx.try_recv() {
            Ok(ServerToClient::ResourceCreatedOrUpdated { resource }) => {
                assert_eq!(resource.id, resource_id);
            }
            other => panic!("expected ResourceCreatedOrUpdated, got {other:?}"),
        }
    }
}
