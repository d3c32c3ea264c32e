//! Topic naming for the pub/sub fabric (spec §2 L0).

use std::fmt;

use crate::domain::{AccountId, ActorGroupId, ClientId, GatewayGroupId, GatewayId, PolicyId};

/// A topic name. Interned as a plain `String` key into the broker's map;
/// construct one of these rather than formatting ad hoc so every caller
/// agrees on the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    #[must_use]
    pub fn account(id: AccountId) -> Self {
        Self(format!("account:{id}"))
    }

    #[must_use]
    pub fn client(id: ClientId) -> Self {
        Self(format!("client:{id}"))
    }

    #[must_use]
    pub fn gateway(id: GatewayId) -> Self {
        Self(format!("gateway:{id}"))
    }

    #[must_use]
    pub fn policy(id: PolicyId) -> Self {
        Self(format!("policy:{id}"))
    }

    #[must_use]
    pub fn actor_group_policies(id: ActorGroupId) -> Self {
        Self(format!("actor_group:{id}/policies"))
    }

    #[must_use]
    pub fn global_relays() -> Self {
        Self("presence:global_relays".to_string())
    }

    #[must_use]
    pub fn gateway_group(id: GatewayGroupId) -> Self {
        Self(format!("presence:gateway_group/{id}"))
    }

    /// Arbitrary socket-id topic for token/session revocation pushes.
    #[must_use]
    pub fn socket(socket_id: &str) -> Self {
        Self(format!("socket:{socket_id}"))
    }

    /// SQL-effectful cascade work a hook triggers but doesn't perform
    /// itself (spec §7): one process-wide topic, consumed only by
    /// [`crate::hooks::cascade::CascadeWorker`].
    #[must_use]
    pub fn cascade() -> Self {
        Self("cascade".to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn account_topic_format() {
        let id = AccountId::new(Uuid::nil());
        assert_eq!(
            Topic::account(id).as_str(),
            "account:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn actor_group_policies_topic_format() {
        let id = ActorGroupId::new(Uuid::nil());
        assert_eq!(
            Topic::actor_group_policies(id).as_str(),
            "actor_group:00000000-0000-0000-0000-000000000000/policies"
        );
    }
}
