//! Process-local directory of live channel actors (spec §4.5's rendezvous,
//! §5 "per-process caches are private").
//!
//! The WAL/pub-sub fabric fans *domain events* out to every subscriber of a
//! topic; rendezvous is different; it is a point-to-point handoff between
//! exactly one client channel and exactly one gateway channel, named by the
//! ids socket join assigned them. This registry is that addressing layer —
//! a concurrent map from id to [`AgentHandle`], mirroring the shape of
//! [`crate::pubsub::broker::PubSub`] but keyed by entity id instead of
//! topic, and carrying at most one subscriber per key instead of a set.

use std::sync::Arc;

use acton_reactive::prelude::AgentHandle;
use dashmap::DashMap;

use crate::domain::{ClientId, GatewayId};

#[derive(Clone, Default)]
pub struct ChannelRegistry {
    clients: Arc<DashMap<ClientId, AgentHandle>>,
    gateways: Arc<DashMap<GatewayId, AgentHandle>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&self, client_id: ClientId, handle: AgentHandle) {
        self.clients.insert(client_id, handle);
    }

    pub fn unregister_client(&self, client_id: ClientId) {
        self.clients.remove(&client_id);
    }

    #[must_use]
    pub fn client(&self, client_id: ClientId) -> Option<AgentHandle> {
        self.clients.get(&client_id).map(|entry| entry.value().clone())
    }

    pub fn register_gateway(&self, gateway_id: GatewayId, handle: AgentHandle) {
        self.gateways.insert(gateway_id, handle);
    }

    pub fn unregister_gateway(&self, gateway_id: GatewayId) {
        self.gateways.remove(&gateway_id);
    }

    #[must_use]
    pub fn gateway(&self, gateway_id: GatewayId) -> Option<AgentHandle> {
        self.gateways.get(&gateway_id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_entries() {
        let registry = ChannelRegistry::new();
        assert!(registry.client(ClientId::new(uuid::Uuid::nil())).is_none());
        assert!(registry.gateway(GatewayId::new(uuid::Uuid::nil())).is_none());
    }
}
