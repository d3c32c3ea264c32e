//! Gateway-side connection state: per-socket flow cache, the channel
//! actor that owns it, and the rendezvous handshake helpers.

pub mod cache;
pub mod channel;
pub mod rendezvous;

#[cfg(feature = "database")]
pub mod repository;

pub use cache::{ClientResourcePair, GatewayCache, ReauthorizeOutcome};
pub use channel::{GatewayChannel, GatewayChannelState, ReauthorizeDeletedFlow};
pub use rendezvous::{build_authorize_flow, rewrite_resource_for_version, RendezvousRequest};

#[cfg(feature = "database")]
pub use repository::{hydrate_gateway, resolve_site, upsert_gateway};
