//! Wire messages for the two WebSocket endpoints (spec §6).
//!
//! Every frame is `{"event": "...", "payload": {...}}`, one object per
//! text frame — the same shape the teacher's room broadcasts use,
//! just with a typed payload per event instead of a raw string.

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ClientId, GatewayId, Resource, ResourceId, ResourceType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayCredential {
    pub id: String,
    pub addr_v4: Option<String>,
    pub addr_v6: Option<String>,
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

// ---- client socket: server -> client ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerToClient {
    #[serde(rename = "init")]
    Init {
        account_slug: String,
        interface: Interface,
        resources: Vec<ResourceWire>,
        relays: Vec<RelayCredential>,
    },
    #[serde(rename = "resource_created_or_updated")]
    ResourceCreatedOrUpdated { resource: ResourceWire },
    #[serde(rename = "resource_deleted")]
    ResourceDeleted { resource_id: ResourceId },
    #[serde(rename = "config_changed")]
    ConfigChanged,
    #[serde(rename = "relays_presence")]
    RelaysPresence {
        disconnected_ids: Vec<String>,
        connected: Vec<RelayCredential>,
    },
    #[serde(rename = "access_authorization_expiry_updated")]
    AccessAuthorizationExpiryUpdated {
        resource_id: ResourceId,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "disconnect")]
    Disconnect { reason: String },
    #[serde(rename = "connect")]
    Connect {
        gateway_public_key: String,
        gateway_ipv4: Ipv4Addr,
        gateway_ipv6: Ipv6Addr,
        preshared_key: String,
        ice_credentials: IceCredentials,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceWire {
    pub id: ResourceId,
    pub resource_type: String,
    pub address: String,
    pub address_description: Option<String>,
    pub name: String,
}

// ---- client socket: client -> server ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientToServer {
    #[serde(rename = "prepare_connection")]
    PrepareConnection { resource_id: ResourceId },
    #[serde(rename = "reuse_connection")]
    ReuseConnection {
        resource_id: ResourceId,
        gateway_id: GatewayId,
    },
}

// ---- gateway socket: server -> gateway ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerToGateway {
    #[serde(rename = "init")]
    Init {
        account_slug: String,
        interface: Interface,
        relays: Vec<RelayCredential>,
        masquerade_ipv4: bool,
        masquerade_ipv6: bool,
    },
    #[serde(rename = "authorize_flow")]
    AuthorizeFlow {
        #[serde(rename = "ref")]
        reference: String,
        resource: ResourceWire,
        client_id: ClientId,
        client_public_key: String,
        ice_credentials: IceCredentials,
        preshared_key: String,
        expires_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "access_authorization_expiry_updated")]
    AccessAuthorizationExpiryUpdated {
        client_id: ClientId,
        resource_id: ResourceId,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "resource_updated")]
    ResourceUpdated { resource: ResourceWire },
    #[serde(rename = "reject_access")]
    RejectAccess {
        client_id: ClientId,
        resource_id: ResourceId,
    },
    /// Legacy path for gateways below v1.4 (spec §6).
    #[serde(rename = "allow_access")]
    AllowAccess {
        client_id: ClientId,
        resource: ResourceWire,
        expires_at: Option<DateTime<Utc>>,
    },
}

// ---- gateway socket: gateway -> server ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum GatewayToServer {
    #[serde(rename = "flow_authorized")]
    FlowAuthorized {
        #[serde(rename = "ref")]
        reference: String,
    },
    #[serde(rename = "broadcast_ice_candidates")]
    BroadcastIceCandidates {
        candidates: Vec<String>,
        client_ids: Vec<ClientId>,
    },
    #[serde(rename = "broadcast_invalidated_ice_candidates")]
    BroadcastInvalidatedIceCandidates {
        candidates: Vec<String>,
        client_ids: Vec<ClientId>,
    },
    /// Legacy path for gateways below v1.4.
    #[serde(rename = "connection_ready")]
    ConnectionReady {
        #[serde(rename = "ref")]
        reference: String,
        gateway_public_key: String,
    },
}
