//! Relay selection for rendezvous credentials (spec §4.5).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::rng;
use rand::seq::{IndexedRandom, SliceRandom};
use sha1::Sha1;

use crate::domain::GeoLocation;

use super::geo::distance_km;
use super::registry::RelayPresence;

/// Relay credentials are valid for 90 days from issuance.
pub const RELAY_CREDENTIAL_TTL: Duration = Duration::days(90);

/// TURN REST API (RFC 5766 §10) style ephemeral credential: the username
/// is `<expiry-unix-ts>:<owner>`, the password is
/// `base64(HMAC-SHA1(stamp_secret, username))`. Clients and gateways derive
/// the same password independently from the username and the stamp secret
/// they already have, per the glossary's "Stamp secret".
#[must_use]
pub fn derive_credential(stamp_secret: &str, owner: &str, expires_at: DateTime<Utc>) -> (String, String) {
    let username = format!("{}:{}", expires_at.timestamp(), owner);
    let mut mac = Hmac::<Sha1>::new_from_slice(stamp_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(username.as_bytes());
    let password = STANDARD.encode(mac.finalize().into_bytes());
    (username, password)
}

#[derive(Debug, Clone)]
pub struct SelectedRelay {
    pub relay: RelayPresence,
    pub credential_expires_at: DateTime<Utc>,
}

/// Pick up to two relays, load-balanced by geographic distance to
/// `from`. Relays are grouped by exact `(lat, lon)`; the two nearest
/// groups are kept, one relay chosen at random from each. When `from`
/// is `None` (unknown gateway/client location) the whole set is
/// shuffled and the first two are taken instead.
#[must_use]
pub fn select_relays(relays: &[RelayPresence], from: Option<GeoLocation>, now: DateTime<Utc>) -> Vec<SelectedRelay> {
    if relays.is_empty() {
        return vec![];
    }

    let mut rng = rng();

    let chosen: Vec<RelayPresence> = match from {
        None => {
            let mut pool: Vec<RelayPresence> = relays.to_vec();
            pool.shuffle(&mut rng);
            pool.into_iter().take(2).collect()
        }
        Some(origin) => {
            let mut groups: Vec<(Option<(i64, i64)>, Vec<&RelayPresence>)> = Vec::new();
            for relay in relays {
                let key = relay.location.map(|loc| (quantize(loc.lat), quantize(loc.lon)));
                if let Some(group) = groups.iter_mut().find(|(k, _)| *k == key) {
                    group.1.push(relay);
                } else {
                    groups.push((key, vec![relay]));
                }
            }

            groups.sort_by(|a, b| {
                let da = group_distance(&a.1, origin);
                let db = group_distance(&b.1, origin);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });

            groups
                .into_iter()
                .take(2)
                .filter_map(|(_, members)| members.choose(&mut rng).map(|r| (*r).clone()))
                .collect()
        }
    };

    chosen
        .into_iter()
        .map(|relay| SelectedRelay {
            relay,
            credential_expires_at: now + RELAY_CREDENTIAL_TTL,
        })
        .collect()
}

fn group_distance(members: &[&RelayPresence], origin: GeoLocation) -> f64 {
    members
        .first()
        .and_then(|r| r.location)
        .map(|loc| distance_km(origin, loc))
        .unwrap_or(f64::MAX)
}

/// Quantize a coordinate to ~1m precision so floating-point noise
/// doesn't split what's really one physical site into multiple groups.
fn quantize(value: f64) -> i64 {
    (value * 1e5).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RelayId;
    use uuid::Uuid;

    #[test]
    fn unknown_location_shuffles_and_takes_two() {
        let registry = crate::presence::registry::PresenceRegistry::new(1);
        for _ in 0..5 {
            registry.relay_joined(RelayId::new(Uuid::new_v4()), "s".into(), None);
        }
        let relays = registry.online_relays();
        let selected = select_relays(&relays, None, Utc::now());
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn nearest_groups_are_preferred() {
        let registry = crate::presence::registry::PresenceRegistry::new(1);
        let near = RelayId::new(Uuid::new_v4());
        let far = RelayId::new(Uuid::new_v4());
        registry.relay_joined(near, "near".into(), Some(GeoLocation { lat: 0.01, lon: 0.01 }));
        registry.relay_joined(far, "far".into(), Some(GeoLocation { lat: 45.0, lon: 45.0 }));

        let relays = registry.online_relays();
        let origin = GeoLocation { lat: 0.0, lon: 0.0 };
        let selected = select_relays(&relays, Some(origin), Utc::now());
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().any(|s| s.relay.relay_id == near));
    }

    #[test]
    fn credential_expires_ninety_days_out() {
        let registry = crate::presence::registry::PresenceRegistry::new(1);
        registry.relay_joined(RelayId::new(Uuid::new_v4()), "s".into(), None);
        let relays = registry.online_relays();
        let now = Utc::now();
        let selected = select_relays(&relays, None, now);
        assert_eq!(selected[0].credential_expires_at, now + RELAY_CREDENTIAL_TTL);
    }
}
