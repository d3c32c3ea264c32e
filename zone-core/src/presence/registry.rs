//! Presence registry: which gateways and relays are currently online.
//!
//! A last-write-wins map, grounded in spec §5's "per-node replicated LWW
//! map, merges on cluster heartbeat". This crate targets a single-node
//! deployment so `merge` is exercised only by tests today, but the clock
//! is real so a future multi-node build doesn't need to touch callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::{GatewayGroupId, GatewayId, GeoLocation, RelayId};

/// `(node_epoch, local_counter)` — unique per process incarnation, so
/// ties across nodes are impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogicalClock {
    pub node_epoch: u64,
    pub local_counter: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayPresence {
    pub gateway_id: GatewayId,
    pub group_id: GatewayGroupId,
    pub location: Option<GeoLocation>,
    clock: LogicalClock,
}

#[derive(Debug, Clone)]
pub struct RelayPresence {
    pub relay_id: RelayId,
    pub stamp_secret: String,
    pub location: Option<GeoLocation>,
    clock: LogicalClock,
}

/// A batch of remote entries to merge in, as received on a cluster
/// heartbeat.
#[derive(Debug, Default)]
pub struct PresenceDelta {
    pub gateways: Vec<GatewayPresence>,
    pub relays: Vec<RelayPresence>,
}

pub struct PresenceRegistry {
    node_epoch: u64,
    counter: AtomicU64,
    gateways: DashMap<GatewayId, GatewayPresence>,
    relays: DashMap<RelayId, RelayPresence>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(node_epoch: u64) -> Self {
        Self {
            node_epoch,
            counter: AtomicU64::new(0),
            gateways: DashMap::new(),
            relays: DashMap::new(),
        }
    }

    fn next_clock(&self) -> LogicalClock {
        LogicalClock {
            node_epoch: self.node_epoch,
            local_counter: self.counter.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn gateway_joined(
        &self,
        gateway_id: GatewayId,
        group_id: GatewayGroupId,
        location: Option<GeoLocation>,
    ) {
        let clock = self.next_clock();
        self.gateways.insert(
            gateway_id,
            GatewayPresence {
                gateway_id,
                group_id,
                location,
                clock,
            },
        );
    }

    pub fn gateway_left(&self, gateway_id: GatewayId) {
        self.gateways.remove(&gateway_id);
    }

    pub fn relay_joined(
        &self,
        relay_id: RelayId,
        stamp_secret: String,
        location: Option<GeoLocation>,
    ) {
        let clock = self.next_clock();
        self.relays.insert(
            relay_id,
            RelayPresence {
                relay_id,
                stamp_secret,
                location,
                clock,
            },
        );
    }

    pub fn relay_left(&self, relay_id: RelayId) {
        self.relays.remove(&relay_id);
    }

    #[must_use]
    pub fn online_gateways(&self, group_id: GatewayGroupId) -> Vec<GatewayPresence> {
        self.gateways
            .iter()
            .filter(|e| e.group_id == group_id)
            .map(|e| e.clone())
            .collect()
    }

    #[must_use]
    pub fn online_relays(&self) -> Vec<RelayPresence> {
        self.relays.iter().map(|e| e.clone()).collect()
    }

    #[must_use]
    pub fn relay(&self, relay_id: RelayId) -> Option<RelayPresence> {
        self.relays.get(&relay_id).map(|e| e.clone())
    }

    /// Apply a remote delta using the LWW rule: an incoming entry
    /// replaces the local one only if its clock is strictly greater.
    pub fn merge(&self, delta: PresenceDelta) {
        for incoming in delta.gateways {
            match self.gateways.get(&incoming.gateway_id) {
                Some(existing) if existing.clock >= incoming.clock => {}
                _ => {
                    self.gateways.insert(incoming.gateway_id, incoming);
                }
            }
        }
        for incoming in delta.relays {
            match self.relays.get(&incoming.relay_id) {
                Some(existing) if existing.clock >= incoming.clock => {}
                _ => {
                    self.relays.insert(incoming.relay_id, incoming);
                }
            }
        }
    }

    /// Snapshot suitable for shipping to peers on the next heartbeat.
    #[must_use]
    pub fn snapshot(&self) -> PresenceDelta {
        PresenceDelta {
            gateways: self.gateways.iter().map(|e| e.clone()).collect(),
            relays: self.relays.iter().map(|e| e.clone()).collect(),
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Shared handle type stored in [`crate::state::AppState`].
pub type SharedPresence = Arc<PresenceRegistry>;

/// Used by tests that want a deterministic set of relay locations keyed
/// by id, without a full registry.
pub fn index_by_id(relays: &[RelayPresence]) -> HashMap<RelayId, &RelayPresence> {
    relays.iter().map(|r| (r.relay_id, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn gateway_joined_then_left_is_absent() {
        let registry = PresenceRegistry::new(1);
        let group = GatewayGroupId::new(Uuid::nil());
        let gw = GatewayId::new(Uuid::new_v4());
        registry.gateway_joined(gw, group, None);
        assert_eq!(registry.online_gateways(group).len(), 1);
        registry.gateway_left(gw);
        assert_eq!(registry.online_gateways(group).len(), 0);
    }

    #[test]
    fn merge_applies_strictly_newer_entries_only() {
        let registry = PresenceRegistry::new(1);
        let relay_id = RelayId::new(Uuid::new_v4());
        registry.relay_joined(relay_id, "secret-a".into(), None);
        let stale_clock = LogicalClock {
            node_epoch: 0,
            local_counter: 0,
        };
        registry.merge(PresenceDelta {
            gateways: vec![],
            relays: vec![RelayPresence {
                relay_id,
                stamp_secret: "stale".into(),
                location: None,
                clock: stale_clock,
            }],
        });
        assert_eq!(registry.relay(relay_id).unwrap().stamp_secret, "secret-a");
    }
}
