//! Entity shapes shared by the cache, hooks, and policy evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

use super::ids::{
    AccountId, ActorGroupId, ActorId, AuthProviderId, ClientId, FlowId, GatewayId,
    GatewayTokenId, MembershipId, PolicyId, PortalSessionId, ResourceId, SiteId, TokenId,
};

/// Name reserved for the synthesized, never-persisted "contains everyone" group.
pub const EVERYONE_GROUP_NAME: &str = "Everyone";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub slug: String,
    pub name: String,
    pub features: Vec<String>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Admin,
    User,
    ServiceAccount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub account_id: AccountId,
    pub actor_type: ActorType,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Actor {
    /// Service accounts are never implicitly members of "Everyone".
    #[must_use]
    pub fn is_everyone_eligible(&self) -> bool {
        self.actor_type != ActorType::ServiceAccount
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorGroupType {
    Managed,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorGroup {
    pub id: ActorGroupId,
    pub account_id: AccountId,
    pub group_type: ActorGroupType,
    pub name: String,
    pub directory: Option<String>,
    pub idp_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ActorGroup {
    #[must_use]
    pub fn is_everyone(&self) -> bool {
        self.group_type == ActorGroupType::Managed && self.name == EVERYONE_GROUP_NAME
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub group_id: ActorGroupId,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub external_id: String,
    /// Base64-encoded WireGuard public key, always 44 characters.
    pub public_key: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub last_seen_user_agent: Option<String>,
    pub last_seen_version: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Client {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    pub account_id: AccountId,
    pub site_id: SiteId,
    pub external_id: String,
    pub public_key: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub last_seen_version: String,
    pub last_seen_location: Option<GeoLocation>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub account_id: AccountId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Dns,
    Cidr,
    Ip,
    Internet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStack {
    Ipv4,
    Ipv6,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterProtocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub protocol: FilterProtocol,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub site_id: Option<SiteId>,
    pub resource_type: ResourceType,
    pub address: String,
    pub address_description: Option<String>,
    pub ip_stack: Option<IpStack>,
    pub filters: Vec<ResourceFilter>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// A resource is only reachable if it has a site; the core never
    /// surfaces a siteless resource to a client (invariant 4).
    #[must_use]
    pub fn has_site(&self) -> bool {
        self.site_id.is_some()
    }

    /// Apply the `ip_stack` defaulting/reset rule on a type change.
    pub fn normalize_ip_stack(&mut self, previous_type: Option<ResourceType>) {
        match self.resource_type {
            ResourceType::Dns if self.ip_stack.is_none() => {
                self.ip_stack = Some(IpStack::Dual);
            }
            ResourceType::Dns => {}
            _ if previous_type == Some(ResourceType::Dns) => {
                self.ip_stack = None;
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCondition {
    pub property: String,
    pub operator: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub account_id: AccountId,
    pub actor_group_id: ActorGroupId,
    pub resource_id: ResourceId,
    pub conditions: Vec<PolicyCondition>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Policy {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.disabled_at.is_none() && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub account_id: AccountId,
    pub policy_id: PolicyId,
    pub actor_group_membership_id: MembershipId,
    pub token_id: TokenId,
    pub client_id: ClientId,
    pub gateway_id: GatewayId,
    pub resource_id: ResourceId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProvider {
    pub id: AuthProviderId,
    pub account_id: AccountId,
}

/// A client's long-lived auth token (table `tokens`). Opaque beyond its
/// lifecycle: creation is an external collaborator's job (admin API /
/// join handshake), this crate only reads `expires_at` to bound a
/// policy's effective grant (`min(condition_expires_at, token_expires_at)`,
/// spec §3) and observes deletion via WAL to broadcast `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientToken {
    pub id: TokenId,
    pub client_id: ClientId,
    pub account_id: AccountId,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

/// A gateway's long-lived auth token (table `gateway_tokens`). Same
/// opaque-lifecycle contract as [`ClientToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayToken {
    pub id: GatewayTokenId,
    pub gateway_id: GatewayId,
    pub account_id: AccountId,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

/// An admin portal session (table `portal_sessions`). Same opaque-lifecycle
/// contract as [`ClientToken`]; this crate never authorizes against it,
/// it only observes deletion to broadcast `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: PortalSessionId,
    pub actor_id: ActorId,
    pub account_id: AccountId,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn resource(rt: ResourceType, stack: Option<IpStack>) -> Resource {
        Resource {
            id: ResourceId::new(Uuid::nil()),
            account_id: AccountId::new(Uuid::nil()),
            site_id: None,
            resource_type: rt,
            address: "example".into(),
            address_description: None,
            ip_stack: stack,
            filters: vec![],
            deleted_at: None,
        }
    }

    #[test]
    fn dns_resource_defaults_to_dual_stack() {
        let mut r = resource(ResourceType::Dns, None);
        r.normalize_ip_stack(None);
        assert_eq!(r.ip_stack, Some(IpStack::Dual));
    }

    #[test]
    fn changing_away_from_dns_clears_ip_stack() {
        let mut r = resource(ResourceType::Cidr, Some(IpStack::Dual));
        r.normalize_ip_stack(Some(ResourceType::Dns));
        assert_eq!(r.ip_stack, None);
    }

    #[test]
    fn explicit_ip_stack_on_dns_is_preserved() {
        let mut r = resource(ResourceType::Dns, Some(IpStack::Ipv4));
        r.normalize_ip_stack(None);
        assert_eq!(r.ip_stack, Some(IpStack::Ipv4));
    }
}
