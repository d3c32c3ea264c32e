//! Cold-start hydration for [`super::cache::GatewayCache`] (spec §4.5).
//!
//! Mirrors [`crate::client::repository`]: a gateway that just joined has
//! no idea which flows the control plane already authorized for it, so
//! this loads every non-expired one from `flows` before the channel
//! starts applying WAL deltas.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{ClientId, FlowId, GatewayId, ResourceId, SiteId};
use crate::error::Result;

/// `(client_id, resource_id, flow_id, expires_at_unix_secs)` for every
/// flow this gateway currently has authorized, feeding
/// [`super::cache::GatewayCache::hydrate`] directly.
pub async fn hydrate_gateway(
    pool: &PgPool,
    gateway_id: GatewayId,
) -> Result<Vec<(ClientId, ResourceId, FlowId, i64)>> {
    let rows = sqlx::query(
        "SELECT client_id, resource_id, id, expires_at FROM flows \
         WHERE gateway_id = $1 AND expires_at > now()",
    )
    .bind(gateway_id.into_inner())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let client_id: Uuid = row.get("client_id");
            let resource_id: Uuid = row.get("resource_id");
            let flow_id: Uuid = row.get("id");
            let expires_at: chrono::DateTime<chrono::Utc> = row.get("expires_at");
            (
                ClientId::new(client_id),
                ResourceId::new(resource_id),
                FlowId::new(flow_id),
                expires_at.timestamp(),
            )
        })
        .collect())
}

/// Resolves a site by `(account_id, name)`, creating it on first sight.
/// The gateway join payload (spec §6) names a site, not an id — sites
/// are never created any other way in this crate, so "upsert" here
/// really is "find, or create once."
pub async fn resolve_site(pool: &PgPool, account_id: Uuid, name: &str) -> Result<SiteId> {
    if let Some(id) =
        sqlx::query_scalar::<_, Uuid>("SELECT id FROM sites WHERE account_id = $1 AND name = $2")
            .bind(account_id)
            .bind(name)
            .fetch_optional(pool)
            .await?
    {
        return Ok(SiteId::new(id));
    }

    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO sites (id, account_id, name) VALUES (gen_random_uuid(), $1, $2) \
         ON CONFLICT (account_id, name) DO UPDATE SET name = EXCLUDED.name \
         RETURNING id",
    )
    .bind(account_id)
    .bind(name)
    .fetch_one(pool)
    .await?;

    Ok(SiteId::new(id))
}

/// Upserts a gateway's connection-time fields on socket join, keyed by
/// `(account_id, site_id, external_id)`. Allocates a fresh tunnel
/// address pair only on first insert — an existing gateway keeps its
/// address across reconnects, since live flows reference it.
pub async fn upsert_gateway(
    pool: &PgPool,
    account_id: Uuid,
    site_id: SiteId,
    external_id: &str,
    public_key: &str,
    version: &str,
    ipv4: std::net::Ipv4Addr,
    ipv6: std::net::Ipv6Addr,
) -> Result<GatewayId> {
    let row = sqlx::query(
        "INSERT INTO gateways \
           (id, account_id, site_id, external_id, public_key, ipv4, ipv6, last_seen_version) \
         VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (account_id, site_id, external_id) DO UPDATE SET \
           public_key = EXCLUDED.public_key, \
           last_seen_version = EXCLUDED.last_seen_version \
         RETURNING id",
    )
    .bind(account_id)
    .bind(site_id.into_inner())
    .bind(external_id)
    .bind(public_key)
    .bind(ipv4.to_string())
    .bind(ipv6.to_string())
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(GatewayId::new(row.get("id")))
}
