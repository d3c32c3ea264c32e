//! Client-side connection state: per-socket policy/resource cache and
//! the channel actor that owns it (spec §4.4).

pub mod cache;
pub mod channel;

#[cfg(feature = "database")]
pub mod repository;

pub use cache::{AuthorizeOutcome, ClientCache, PolicyResourceMissing, RecomputeDiff};
pub use channel::{AuthorizeRequest, ClientChannel, ClientChannelState};

#[cfg(feature = "database")]
pub use repository::{fetch_active_token_expiry, hydrate_client, upsert_client, ClientHydration};
