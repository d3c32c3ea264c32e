//! Per-gateway-connection actor (spec §4.5, §5).
//!
//! One [`GatewayChannel`] per connected gateway socket, following the
//! same spawn/`mutate_on`/`act_on` shape as [`crate::client::channel::ClientChannel`]
//! and [`crate::transport::registry::ChannelRegistry`]. The socket's outbound
//! sink is an `mpsc::UnboundedSender<ServerToGateway>`, mirroring the
//! teacher's `RoomMember::sender` — the transport layer owns turning
//! those messages into WebSocket frames.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use acton_reactive::prelude::*;
use chrono::Utc;
use tokio::sync::{mpsc, Notify};

use crate::client::channel::PushConnect;
use crate::domain::{
    AccountId, ActorId, ClientId, FlowId, Gateway, GatewayGroupId, GatewayId, Policy, Resource,
    ResourceId,
};
use crate::policy::EvaluationContext;
use crate::presence::SharedPresence;
use crate::pubsub::{DomainEvent, PubSub, SubscriberId, Topic};
use crate::transport::messages::{
    IceCredentials, Interface, RelayCredential, ResourceWire, ServerToGateway,
};
use crate::transport::ref_token::decode_ref;
use crate::transport::registry::ChannelRegistry;
use crate::transport::version::ProtocolVersion;

use super::cache::{GatewayCache, ReauthorizeOutcome};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub struct GatewayChannelState {
    pub gateway_id: GatewayId,
    pub group_id: GatewayGroupId,
    pub account_id: AccountId,
    pub version: ProtocolVersion,
    pub cache: GatewayCache,
    pub last_applied_lsn: u64,
    pub outbound: mpsc::UnboundedSender<ServerToGateway>,
    pub pubsub: PubSub,
    pub presence: SharedPresence,
    pub account_subscriber: Option<SubscriberId>,
    pub socket_subscriber: Option<SubscriberId>,
    pub public_key: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub registry: ChannelRegistry,
    /// HMAC key validating incoming `flow_authorized` refs; `None` drops
    /// every such report rather than trusting an unsigned one.
    pub signing_key: Option<Arc<Vec<u8>>>,
    /// Notified when the token/session backing this connection is revoked
    /// (spec §4.3's `tokens`/`gateway_tokens` delete rule). The transport
    /// loop owning the actual socket awaits this alongside its read/write
    /// select and tears the connection down when it fires.
    pub close: Arc<Notify>,
}

/// Forwarded by a client channel once it's authorized a `prepare_connection`
/// against this gateway (spec §4.5 step 2-3): push straight to the
/// gateway's own socket.
#[derive(Clone, Debug)]
pub struct PushAuthorizeFlow(pub ServerToGateway);

/// Sent once by the socket handler right after `spawn`, carrying every
/// non-expired flow this gateway already had authorized plus what the
/// `init` frame (spec §6) reports back to it.
#[derive(Clone, Debug)]
pub struct HydrateCache {
    pub account_slug: String,
    pub entries: Vec<(ClientId, ResourceId, FlowId, i64)>,
    pub relays: Vec<RelayCredential>,
}

/// Decoded from the gateway's `flow_authorized` wire message (spec §4.5
/// step 4) by the transport layer before being handed to this actor.
#[derive(Clone, Debug)]
pub struct ReportFlowAuthorized {
    pub reference: String,
}

/// `acton_reactive::AgentRuntime::new_agent` requires `Default`; every
/// field below is immediately overwritten in [`GatewayChannel::spawn`],
/// this just has to type-check. The throwaway sender's receiver is
/// dropped, so anything sent before `spawn` overwrites it is silently lost.
impl Default for GatewayChannelState {
    fn default() -> Self {
        let (outbound, _rx) = mpsc::unbounded_channel();
        Self {
            gateway_id: GatewayId::new(uuid::Uuid::nil()),
            group_id: GatewayGroupId::new(uuid::Uuid::nil()),
            account_id: AccountId::new(uuid::Uuid::nil()),
            version: ProtocolVersion::new(0, 0, 0),
            cache: GatewayCache::default(),
            last_applied_lsn: 0,
            outbound,
            pubsub: PubSub::default(),
            presence: SharedPresence::default(),
            account_subscriber: None,
            socket_subscriber: None,
            public_key: String::new(),
            ipv4: Ipv4Addr::UNSPECIFIED,
            ipv6: Ipv6Addr::UNSPECIFIED,
            registry: ChannelRegistry::default(),
            signing_key: None,
            close: Arc::new(Notify::new()),
        }
    }
}

impl std::fmt::Debug for GatewayChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayChannelState")
            .field("gateway_id", &self.gateway_id)
            .field("last_applied_lsn", &self.last_applied_lsn)
            .finish()
    }
}

#[derive(Clone, Debug)]
struct ApplyDomainEvent(DomainEvent);

#[derive(Clone, Debug)]
struct PruneTick;

/// Sent by a client channel to kick off the rendezvous handshake for
/// one (client, resource) pair.
#[derive(Clone, Debug)]
pub struct ReauthorizeDeletedFlow {
    pub client_id: ClientId,
    pub resource_id: ResourceId,
    pub flow_id: crate::domain::FlowId,
}

pub struct GatewayChannel;

impl GatewayChannel {
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        runtime: &mut AgentRuntime,
        gateway: &Gateway,
        version: ProtocolVersion,
        outbound: mpsc::UnboundedSender<ServerToGateway>,
        pubsub: PubSub,
        presence: SharedPresence,
        registry: ChannelRegistry,
        signing_key: Option<Arc<Vec<u8>>>,
        close: Arc<Notify>,
    ) -> anyhow::Result<AgentHandle> {
        let mut agent = runtime.new_agent::<GatewayChannelState>();

        agent.model.gateway_id = gateway.id;
        agent.model.group_id = GatewayGroupId::new(gateway.site_id.into_inner());
        agent.model.account_id = gateway.account_id;
        agent.model.version = version;
        agent.model.cache = GatewayCache::new(gateway.id);
        agent.model.last_applied_lsn = 0;
        agent.model.outbound = outbound;
        agent.model.pubsub = pubsub;
        agent.model.presence = presence;
        agent.model.account_subscriber = None;
        agent.model.socket_subscriber = None;
        agent.model.public_key = gateway.public_key.clone();
        agent.model.ipv4 = gateway.ipv4;
        agent.model.ipv6 = gateway.ipv6;
        agent.model.registry = registry;
        agent.model.signing_key = signing_key;
        agent.model.close = close;

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

        agent.mutate_on::<PruneTick>(|agent, _envelope| {
            agent.model.cache.prune(Utc::now());
            Reply::ready()
        });

        agent.mutate_on::<PushAuthorizeFlow>(|agent, envelope| {
            let _ = agent.model.outbound.send(envelope.message().0.clone());
            Reply::ready()
        });

        agent.mutate_on::<HydrateCache>(|agent, envelope| {
            let msg = envelope.message().clone();
            agent.model.cache.hydrate(msg.entries);

            let _ = agent.model.outbound.send(ServerToGateway::Init {
                account_slug: msg.account_slug,
                interface: Interface {
                    ipv4: agent.model.ipv4,
                    ipv6: agent.model.ipv6,
                },
                relays: msg.relays,
                masquerade_ipv4: true,
                masquerade_ipv6: true,
            });
            Reply::ready()
        });

        agent.act_on::<ReportFlowAuthorized>(|agent, envelope| {
            let reference = envelope.message().reference.clone();

            let Some(signing_key) = agent.model.signing_key.clone() else {
                tracing::warn!("flow_authorized received with no signing key configured");
                return Reply::ready();
            };

            let claims = match decode_ref(&signing_key, &reference) {
                Ok(claims) => claims,
                Err(err) => {
                    tracing::warn!(error = %err, "flow_authorized: invalid ref");
                    return Reply::ready();
                }
            };

            let Some(client_handle) = agent.model.registry.client(claims.client_channel_id) else {
                tracing::warn!(client_id = %claims.client_channel_id, "flow_authorized: no live client channel");
                return Reply::ready();
            };

            let push = PushConnect {
                gateway_public_key: agent.model.public_key.clone(),
                gateway_ipv4: agent.model.ipv4,
                gateway_ipv6: agent.model.ipv6,
                preshared_key: claims.preshared_key,
                ice_credentials: IceCredentials { ufrag: claims.ice_ufrag, pwd: claims.ice_pwd },
            };

            Reply::pending(async move {
                client_handle.send(push).await;
            })
        });

        agent.after_start(|agent| {
            agent.model.presence.gateway_joined(
                agent.model.gateway_id,
                agent.model.group_id,
                None,
            );

            let topic = Topic::account(agent.model.account_id);
            let (id, mut rx) = agent.model.pubsub.subscribe(&topic);
            agent.model.account_subscriber = Some(id);

            let handle = agent.handle().clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    handle.send(ApplyDomainEvent(event)).await;
                }
            });

            let socket_topic = Topic::socket(&agent.model.gateway_id.to_string());
            let (socket_id, mut socket_rx) = agent.model.pubsub.subscribe(&socket_topic);
            agent.model.socket_subscriber = Some(socket_id);

            let handle = agent.handle().clone();
            tokio::spawn(async move {
                while let Some(event) = socket_rx.recv().await {
                    handle.send(ApplyDomainEvent(event)).await;
                }
            });

            let prune_handle = agent.handle().clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PRUNE_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    prune_handle.send(PruneTick).await;
                }
            });

            agent.model.registry.register_gateway(agent.model.gateway_id, agent.handle().clone());

            Reply::ready()
        });

        agent.before_stop(|agent| {
            agent.model.presence.gateway_left(agent.model.gateway_id);
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
                    .unsubscribe(&Topic::socket(&agent.model.gateway_id.to_string()), id);
            }
            agent.model.registry.unregister_gateway(agent.model.gateway_id);
            tracing::info!(gateway_id = %agent.model.gateway_id, "gateway channel closing");
            Reply::ready()
        });

        let handle = agent.start().await;
        Ok(handle)
    }
}

fn apply_event(state: &mut GatewayChannelState, event: DomainEvent) {
    match event {
        DomainEvent::Resource(change) => {
            // A resource whose address/type/ip_stack changed cascades a
            // `reject_access` to every (client, resource) pair this
            // gateway currently serves for it; a filters-only change keeps
            // the gateway serving it and just pushes the refreshed wire
            // form instead (spec §4.3).
            if let Some(new) = &change.new {
                if state.cache.has_resource(new.id) {
                    let breaking = change
                        .old
                        .as_ref()
                        .map(|old| {
                            old.address != new.address
                                || old.resource_type != new.resource_type
                                || old.ip_stack != new.ip_stack
                        })
                        .unwrap_or(true);
                    if breaking {
                        for pair in state.cache.all_pairs_for_resource(new.id) {
                            let _ = state.outbound.send(ServerToGateway::RejectAccess {
                                client_id: pair.client_id,
                                resource_id: pair.resource_id,
                            });
                        }
                    } else {
                        let _ = state.outbound.send(ServerToGateway::ResourceUpdated {
                            resource: gateway_resource_wire(new),
                        });
                    }
                }
            }
        }
        DomainEvent::Account(change) => {
            // Slug change: resend `init` to every connected gateway of the
            // account, mirroring `client::channel`'s `ConfigChanged` push
            // for the same event (spec §4.3).
            if let (Some(old), Some(new)) = (&change.old, &change.new) {
                if old.slug != new.slug {
                    let _ = state.outbound.send(ServerToGateway::Init {
                        account_slug: new.slug.clone(),
                        interface: Interface {
                            ipv4: state.ipv4,
                            ipv6: state.ipv6,
                        },
                        relays: Vec::new(),
                        masquerade_ipv4: true,
                        masquerade_ipv6: true,
                    });
                }
            }
        }
        DomainEvent::ExpireFlow {
            gateway_id,
            client_id,
            resource_id,
            flow_id,
        } if gateway_id == state.gateway_id => {
            // No candidate policies are threaded through this event, so a
            // pair with another still-live flow is reauthorized from the
            // cache alone; a pair whose last flow just expired always
            // falls through to `Unauthorized` here rather than re-running
            // the evaluator against a database this dispatch path can't
            // reach. Closing that gap means carrying the resource's policy
            // set on `ExpireFlow` itself, or fetching it before reauthorize.
            let outcome = state.cache.reauthorize_deleted_flow(
                client_id,
                resource_id,
                flow_id,
                &[],
                &placeholder_eval_ctx(),
                || FlowId::new(uuid::Uuid::new_v4()),
                Utc::now(),
            );
            if matches!(outcome, ReauthorizeOutcome::Unauthorized) {
                let _ = state.outbound.send(ServerToGateway::RejectAccess {
                    client_id,
                    resource_id,
                });
            }
        }
        DomainEvent::Disconnect => {
            state.close.notify_one();
        }
        _ => {}
    }
}

/// Wire form of a resource for the `resource_updated` push. The gateway
/// cache, unlike the client cache, never tracks a resource's denormalized
/// site name, so `name` goes out empty rather than fetched on demand.
fn gateway_resource_wire(resource: &Resource) -> ResourceWire {
    ResourceWire {
        id: resource.id,
        resource_type: format!("{:?}", resource.resource_type).to_lowercase(),
        address: resource.address.clone(),
        address_description: resource.address_description.clone(),
        name: String::new(),
    }
}

/// An evaluation context with no real client behind it, for reauthorize
/// attempts that pass an empty candidate list (the client fields are
/// never read since [`crate::policy::evaluate`] never runs against them).
fn placeholder_eval_ctx() -> EvaluationContext<'static> {
    use std::sync::OnceLock;
    static CLIENT: OnceLock<crate::domain::Client> = OnceLock::new();
    let client = CLIENT.get_or_init(|| crate::domain::Client {
        id: ClientId::new(uuid::Uuid::nil()),
        account_id: AccountId::new(uuid::Uuid::nil()),
        actor_id: ActorId::new(uuid::Uuid::nil()),
        external_id: String::new(),
        public_key: String::new(),
        ipv4: Ipv4Addr::UNSPECIFIED,
        ipv6: Ipv6Addr::UNSPECIFIED,
        last_seen_user_agent: None,
        last_seen_version: String::new(),
        verified_at: None,
        deleted_at: None,
    });
    EvaluationContext {
        client,
        auth_provider_id: None,
        remote_ip: None,
        remote_ip_region: None,
        now: Utc::now(),
        token_expires_at: None,
    }
}

/// Free function used by the transport layer / tests to drive a
/// reauthorize attempt without going through the actor mailbox, given
/// an already-hydrated cache and policy set.
pub fn reauthorize(
    cache: &mut GatewayCache,
    req: ReauthorizeDeletedFlow,
    candidate_policies: &[Policy],
    eval_ctx: &EvaluationContext<'_>,
    new_flow_id: impl FnOnce() -> crate::domain::FlowId,
) -> ReauthorizeOutcome {
    cache.reauthorize_deleted_flow(
        req.client_id,
        req.resource_id,
        req.flow_id,
        candidate_policies,
        eval_ctx,
        new_flow_id,
        Utc::now(),
    )
}

#[allow(dead_code)]
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _assertions() {
    _assert_send::<Arc<GatewayChannelState>>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state_with_gateway() -> (GatewayChannelState, mpsc::UnboundedReceiver<ServerToGateway>) {
        let mut state = GatewayChannelState::default();
        let (tx, rx) = mpsc::unbounded_channel();
        state.gateway_id = GatewayId::new(Uuid::new_v4());
        state.cache = GatewayCache::new(state.gateway_id);
        state.outbound = tx;
        (state, rx)
    }

    #[test]
    fn expire_flow_reauthorizes_from_another_live_flow_without_rejecting() {
        let (mut state, mut rx) = state_with_gateway();
        let client_id = ClientId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let expiring_flow = FlowId::new(Uuid::new_v4());
        let surviving_flow = FlowId::new(Uuid::new_v4());
        state.cache.put(client_id, resource_id, expiring_flow, 100);
        state.cache.put(client_id, resource_id, surviving_flow, 9_999_999_999);

        apply_event(
            &mut state,
            DomainEvent::ExpireFlow {
                gateway_id: state.gateway_id,
                client_id,
                resource_id,
                flow_id: expiring_flow,
            },
        );

        assert_eq!(state.cache.get(client_id, resource_id), Some(9_999_999_999));
        assert!(rx.try_recv().is_err(), "no RejectAccess should be sent while another flow is live");
    }

    #[test]
    fn expire_flow_rejects_when_the_last_flow_for_a_pair_expires() {
        let (mut state, mut rx) = state_with_gateway();
        let client_id = ClientId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let only_flow = FlowId::new(Uuid::new_v4());
        state.cache.put(client_id, resource_id, only_flow, 100);

        apply_event(
            &mut state,
            DomainEvent::ExpireFlow {
                gateway_id: state.gateway_id,
                client_id,
                resource_id,
                flow_id: only_flow,
            },
        );

        assert_eq!(state.cache.get(client_id, resource_id), None);
        match rx.try_recv() {
            Ok(ServerToGateway::RejectAccess { client_id: rejected_client, resource_id: rejected_resource }) => {
                assert_eq!(rejected_client, client_id);
                assert_eq!(rejected_resource, resource_id);
            }
            other => panic!("expected RejectAccess, got {other:?}"),
        }
    }

    #[test]
    fn expire_flow_for_a_different_gateway_is_ignored() {
        let (mut state, mut rx) = state_with_gateway();
        let client_id = ClientId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        let flow_id = FlowId::new(Uuid::new_v4());
        state.cache.put(client_id, resource_id, flow_id, 100);

        apply_event(
            &mut state,
            DomainEvent::ExpireFlow {
                gateway_id: GatewayId::new(Uuid::new_v4()),
                client_id,
                resource_id,
                flow_id,
            },
        );

        assert_eq!(state.cache.get(client_id, resource_id), Some(100));
        assert!(rx.try_recv().is_err());
    }

    fn resource(resource_id: ResourceId, address: &str, filters: Vec<crate::domain::ResourceFilter>) -> Resource {
        Resource {
            id: resource_id,
            account_id: AccountId::new(Uuid::new_v4()),
            site_id: None,
            resource_type: crate::domain::ResourceType::Cidr,
            address: address.to_string(),
            address_description: None,
            ip_stack: None,
            filters,
            deleted_at: None,
        }
    }

    #[test]
    fn resource_filters_only_change_keeps_serving_and_pushes_resource_updated() {
        let (mut state, mut rx) = state_with_gateway();
        let client_id = ClientId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        state.cache.put(client_id, resource_id, FlowId::new(Uuid::new_v4()), 9_999_999_999);

        let old = resource(resource_id, "10.0.0.0/8", vec![]);
        let new = resource(
            resource_id,
            "10.0.0.0/8",
            vec![crate::domain::ResourceFilter {
                protocol: crate::domain::FilterProtocol::Tcp,
                ports: vec!["443".to_string()],
            }],
        );

        apply_event(
            &mut state,
            DomainEvent::Resource(crate::pubsub::Change::update(1, old, new)),
        );

        match rx.try_recv() {
            Ok(ServerToGateway::ResourceUpdated { resource }) => {
                assert_eq!(resource.id, resource_id);
            }
            other => panic!("expected ResourceUpdated, got {other:?}"),
        }
    }

    #[test]
    fn resource_address_change_rejects_every_cached_pair() {
        let (mut state, mut rx) = state_with_gateway();
        let client_id = ClientId::new(Uuid::new_v4());
        let resource_id = ResourceId::new(Uuid::new_v4());
        state.cache.put(client_id, resource_id, FlowId::new(Uuid::new_v4()), 9_999_999_999);

        let old = resource(resource_id, "10.0.0.0/8", vec![]);
        let new = resource(resource_id, "10.0.0.1/32", vec![]);

        apply_event(
            &mut state,
            DomainEvent::Resource(crate::pubsub::Change::update(1, old, new)),
        );

        match rx.try_recv() {
            Ok(ServerToGateway::RejectAccess { client_id: rejected_client, resource_id: rejected_resource }) => {
                assert_eq!(rejected_client, client_id);
                assert_eq!(rejected_resource, resource_id);
            }
            other => panic!("expected RejectAccess, got {other:?}"),
        }
    }

    #[test]
    fn account_slug_change_resends_init() {
        let (mut state, mut rx) = state_with_gateway();
        let account_id = AccountId::new(Uuid::new_v4());
        let old = crate::domain::Account {
            id: account_id,
            slug: "old-slug".into(),
            name: "Acme".into(),
            features: vec![],
            disabled_at: None,
            deleted_at: None,
        };
        let new = crate::domain::Account {
            slug: "new-slug".into(),
            ..old.clone()
        };

        apply_event(
            &mut state,
            DomainEvent::Account(crate::pubsub::Change::update(1, old, new)),
        );

        match rx.try_recv() {
            Ok(ServerToGateway::Init { account_slug, .. }) => {
                assert_eq!(account_slug, "new-slug");
            }
            other => panic!("expected Init, got {other:?}"),
        }
    }
}
