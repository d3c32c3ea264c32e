//! L3: presence tracking and relay selection.

pub mod geo;
pub mod registry;
pub mod relay;

pub use registry::{GatewayPresence, LogicalClock, PresenceDelta, PresenceRegistry, RelayPresence, SharedPresence};
pub use relay::{derive_credential, select_relays, SelectedRelay, RELAY_CREDENTIAL_TTL};
