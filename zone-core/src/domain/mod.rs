//! Core domain types: identifiers, entity shapes, and address parsing.
//!
//! Everything in this module is pure data — no I/O, no actor machinery.
//! The WAL decoder, event hooks, caches, and evaluator all build on these
//! shapes without referring back to their own storage representation.

pub mod address;
pub mod ids;
pub mod model;

pub use address::{parse_address, AddressError, ParsedAddress};
pub use ids::{
    AccountId, ActorGroupId, ActorId, AuthProviderId, ClientId, FlowId, GatewayGroupId, GatewayId,
    GatewayTokenId, MembershipId, PolicyId, PortalSessionId, RelayId, ResourceId, SiteId, TokenId,
};
pub use model::{
    Account, Actor, ActorGroup, ActorGroupType, ActorType, AuthProvider, Client, ClientToken, Flow,
    FilterProtocol, Gateway, GatewayToken, GeoLocation, IpStack, Membership, Policy,
    PolicyCondition, PortalSession, Resource, ResourceFilter, ResourceType, Site,
    EVERYONE_GROUP_NAME,
};
