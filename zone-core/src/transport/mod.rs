//! Wire protocol: message shapes, version gating, and signed rendezvous refs.

pub mod messages;
pub mod ref_token;
pub mod registry;
pub mod version;

pub use messages::{
    ClientToServer, GatewayToServer, IceCredentials, Interface, RelayCredential, ResourceWire,
    ServerToClient, ServerToGateway,
};
pub use ref_token::{decode_ref, encode_ref, RefClaims, RefError};
pub use registry::ChannelRegistry;
pub use version::{
    client_supports_in_place_site_update, client_supports_internet_resource,
    gateway_supports_rendezvous, ProtocolVersion, CLIENT_INTERNET_RESOURCE_MIN_VERSION,
    CLIENT_IN_PLACE_SITE_UPDATE_MIN_VERSION, GATEWAY_RENDEZVOUS_MIN_VERSION,
};
