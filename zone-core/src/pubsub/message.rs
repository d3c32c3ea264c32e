//! The single event type flowing through every topic in the fabric.
//!
//! Every table's event hook (§4.3) ultimately constructs one of these
//! variants. Client and gateway channels match on the variant they care
//! about and ignore the rest — mirroring how a single `Change<T>` per
//! table beats the "generic JSON map" shape the redesign notes call out.

use serde::{Deserialize, Serialize};

use crate::domain::{
    Account, Actor, ActorGroupId, ActorGroup, ActorId, AuthProviderId, Client, ClientId, Flow,
    FlowId, Gateway, GatewayId, Membership, Policy, PolicyId, Resource, ResourceId, Site,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single table's before/after image for one WAL transaction, tagged
/// with the LSN it was observed at so consumers can enforce §3 invariant 6
/// (apply only events with lsn strictly greater than the last applied).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub lsn: u64,
    pub op: ChangeOp,
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> Change<T> {
    #[must_use]
    pub fn insert(lsn: u64, new: T) -> Self {
        Self {
            lsn,
            op: ChangeOp::Insert,
            old: None,
            new: Some(new),
        }
    }

    #[must_use]
    pub fn update(lsn: u64, old: T, new: T) -> Self {
        Self {
            lsn,
            op: ChangeOp::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    #[must_use]
    pub fn delete(lsn: u64, old: T) -> Self {
        Self {
            lsn,
            op: ChangeOp::Delete,
            old: Some(old),
            new: None,
        }
    }

    /// The row image to read entity identity off of: `new` for
    /// insert/update, `old` for delete. Every constructor above sets at
    /// least one side, so this is always present.
    #[must_use]
    pub fn latest(&self) -> &T {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .expect("Change always carries old or new")
    }
}

/// Everything that can be published on the fabric.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    Account(Change<Account>),
    Actor(Change<Actor>),
    ActorGroup(Change<ActorGroup>),
    Membership(Change<Membership>),
    Client(Change<Client>),
    Gateway(Change<Gateway>),
    Site(Change<Site>),
    Resource(Change<Resource>),
    Policy(Change<Policy>),
    Flow(Change<Flow>),

    /// Sent on `actor_group:<id>/policies` and mirrored onto the account
    /// topic when a membership or policy grants a new access path.
    AllowAccess {
        policy_id: PolicyId,
        actor_group_id: ActorGroupId,
    },
    /// Sent on `actor_group:<id>/policies` when an access path is revoked.
    RejectAccess {
        policy_id: Option<PolicyId>,
        client_id: Option<ClientId>,
        resource_id: ResourceId,
    },
    /// Sent on a flow's topic, or broadcast to a gateway's cache, when a
    /// flow should be dropped.
    ExpireFlow {
        flow_id: FlowId,
        client_id: ClientId,
        gateway_id: GatewayId,
        resource_id: ResourceId,
    },
    /// A resource's filters changed but its address/type/ip_stack did not;
    /// gateways keep serving it, clients just refresh their copy.
    ResourceUpdated { resource_id: ResourceId },
    /// A token, gateway token, or portal session was revoked.
    Disconnect,
    /// The global relay presence set changed.
    RelaysPresenceChanged,

    /// **[ADDED]** SQL-effectful cascades a hook triggers but does not
    /// itself perform (spec §4.3 "extra effects", §7 "cascade work ...
    /// runs in a separate task"). Published on [`super::Topic::cascade`]
    /// and consumed only by [`crate::hooks::cascade::CascadeWorker`],
    /// never by a client/gateway channel.
    CascadeDeleteActorSessions { actor_id: ActorId },
    CascadeDeleteAuthProviderSessions { auth_provider_id: AuthProviderId },
    CascadeExpireFlowsForPolicy { policy_id: PolicyId },
    CascadeExpireFlowsForMembership { actor_id: ActorId, group_id: ActorGroupId },
    CascadeDeleteClientAuthorizations { client_id: ClientId },
    CascadeExpireFlowsForResource { resource_id: ResourceId },
}

impl DomainEvent {
    /// The LSN carried by change-shaped events, if any. Control messages
    /// (`AllowAccess`, `Disconnect`, ...) have no LSN of their own and are
    /// never subject to the `last_applied_lsn` gate.
    #[must_use]
    pub fn lsn(&self) -> Option<u64> {
        match self {
            DomainEvent::Account(c) => Some(c.lsn),
            DomainEvent::Actor(c) => Some(c.lsn),
            DomainEvent::ActorGroup(c) => Some(c.lsn),
            DomainEvent::Membership(c) => Some(c.lsn),
            DomainEvent::Client(c) => Some(c.lsn),
            DomainEvent::Gateway(c) => Some(c.lsn),
            DomainEvent::Site(c) => Some(c.lsn),
            DomainEvent::Resource(c) => Some(c.lsn),
            DomainEvent::Policy(c) => Some(c.lsn),
            DomainEvent::Flow(c) => Some(c.lsn),
            _ => None,
        }
    }
}
