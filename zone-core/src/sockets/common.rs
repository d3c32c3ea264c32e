//! Glue shared by both socket handlers (spec §6): relay-credential
//! minting and the one-off account-slug lookup the `init` frame needs.

#[cfg(feature = "database")]
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::GeoLocation;
use crate::error::Result;
use crate::presence::{derive_credential, select_relays, SharedPresence};
use crate::transport::messages::RelayCredential;

/// Picks up to two online relays and mints a fresh TURN-style credential
/// for each, per spec §4.5/§4.7. `from` is the caller's last-known
/// location, if any — `None` falls back to a shuffled pick.
///
/// Relay network addresses aren't tracked anywhere in this crate yet
/// (`RelayPresence` only carries the stamp secret used to derive
/// credentials); `addr_v4`/`addr_v6` stay `None` until a relay registry
/// records them.
pub(crate) fn relay_credentials(presence: &SharedPresence, from: Option<GeoLocation>) -> Vec<RelayCredential> {
    let relays = presence.online_relays();
    let now = chrono::Utc::now();
    select_relays(&relays, from, now)
        .into_iter()
        .map(|selected| {
            let (username, password) = derive_credential(
                &selected.relay.stamp_secret,
                &selected.relay.relay_id.to_string(),
                selected.credential_expires_at,
            );
            RelayCredential {
                id: selected.relay.relay_id.to_string(),
                addr_v4: None,
                addr_v6: None,
                username,
                password,
                expires_at: selected.credential_expires_at,
            }
        })
        .collect()
}

#[cfg(feature = "database")]
pub(crate) async fn account_slug(pool: &PgPool, account_id: Uuid) -> Result<String> {
    use sqlx::Row;

    let row = sqlx::query("SELECT slug FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get("slug"))
}
