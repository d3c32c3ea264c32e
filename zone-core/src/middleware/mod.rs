//! Socket authentication and request-tracking middleware.

// Token abstraction layer (always available)
pub mod token;

// PASETO authentication (default)
pub mod paseto;

// Token revocation (requires cache feature)
#[cfg(feature = "cache")]
pub mod revocation;

pub mod request_tracking;
pub mod security_headers;

// Token abstraction exports (always available)
pub use token::{Claims, TokenValidator};

#[cfg(feature = "cache")]
pub use token::TokenRevocation;

// PASETO exports (default)
pub use paseto::PasetoAuth;

// Token revocation exports (requires cache)
#[cfg(feature = "cache")]
pub use revocation::RedisTokenRevocation;

pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
pub use security_headers::apply_security_headers;
