//! Strongly-typed 128-bit identifiers for every domain entity.
//!
//! Every id is a raw [`Uuid`] inside a newtype. Caches and in-process
//! messages always carry the newtype; only the transport layer converts
//! to/from the textual form clients and gateways send on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! domain_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn into_inner(self) -> Uuid {
                self.0
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

domain_id!(AccountId);
domain_id!(ActorId);
domain_id!(ActorGroupId);
domain_id!(MembershipId);
domain_id!(ClientId);
domain_id!(GatewayId);
domain_id!(SiteId);
domain_id!(ResourceId);
domain_id!(PolicyId);
domain_id!(FlowId);
domain_id!(TokenId);
domain_id!(AuthProviderId);
domain_id!(RelayId);
domain_id!(GatewayGroupId);
domain_id!(GatewayTokenId);
domain_id!(PortalSessionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        let id = Uuid::new_v4();
        let wrapped = ClientId::new(id);
        let parsed: ClientId = wrapped.to_string().parse().unwrap();
        assert_eq!(wrapped, parsed);
        assert_eq!(parsed.into_inner(), id);
    }

    #[test]
    fn serializes_as_bare_uuid_string() {
        let id = ResourceId::new(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
