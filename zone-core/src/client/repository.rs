//! Cold-start hydration for [`super::cache::ClientCache`] (spec §4.4).
//!
//! The WAL consumer only ever emits deltas after this process joins the
//! replication slot; a freshly connected client still needs the grants
//! that already existed. These queries fill that gap once, at socket
//! join, using the same raw-`sqlx::query` idiom as
//! [`crate::hooks::cascade`] rather than the WAL decoders (there is no
//! `RawRow` outside a replication stream).
//!
//! The "Everyone" group is never a row in `actor_group_memberships` —
//! it's synthesized here for any actor whose type makes it eligible
//! (anything but a service account), with no backing [`MembershipId`]
//! since none exists.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{
    ActorGroupId, ActorType, Client, ClientId, IpStack, MembershipId, Policy, PolicyCondition,
    Resource, ResourceFilter, ResourceId, ResourceType, SiteId,
};
use crate::error::Result;

/// Everything [`super::cache::ClientCache::hydrate`] needs for one actor.
pub struct ClientHydration {
    pub policies: Vec<Policy>,
    pub resources: Vec<Resource>,
    pub memberships: Vec<(ActorGroupId, Option<MembershipId>)>,
}

fn parse_enum<T: Copy>(value: &str, variants: &[(&str, T)]) -> Option<T> {
    variants.iter().find(|(name, _)| *name == value).map(|(_, v)| *v)
}

fn resource_type_of(value: &str) -> ResourceType {
    parse_enum(
        value,
        &[
            ("dns", ResourceType::Dns),
            ("cidr", ResourceType::Cidr),
            ("ip", ResourceType::Ip),
            ("internet", ResourceType::Internet),
        ],
    )
    .unwrap_or(ResourceType::Dns)
}

fn ip_stack_of(value: &str) -> Option<IpStack> {
    parse_enum(
        value,
        &[
            ("ipv4", IpStack::Ipv4),
            ("ipv6", IpStack::Ipv6),
            ("dual", IpStack::Dual),
        ],
    )
}

/// Loads every active membership (real plus the synthesized "Everyone"
/// group), then the disabled/deleted-filtered policies and the distinct
/// resources those policies reference, for one actor.
pub async fn hydrate_client(pool: &PgPool, client: &Client) -> Result<ClientHydration> {
    let actor_type: String = sqlx::query_scalar("SELECT type FROM actors WHERE id = $1")
        .bind(client.actor_id.into_inner())
        .fetch_one(pool)
        .await?;

    let mut group_ids: Vec<(ActorGroupId, Option<MembershipId>)> = sqlx::query(
        "SELECT id, group_id FROM actor_group_memberships WHERE actor_id = $1",
    )
    .bind(client.actor_id.into_inner())
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| {
        let membership_id: Uuid = row.get("id");
        let group_id: Uuid = row.get("group_id");
        (ActorGroupId::new(group_id), Some(MembershipId::new(membership_id)))
    })
    .collect();

    let is_everyone_eligible = parse_enum(
        &actor_type,
        &[
            ("admin", ActorType::Admin),
            ("user", ActorType::User),
            ("service_account", ActorType::ServiceAccount),
        ],
    )
    .map(|t| t != ActorType::ServiceAccount)
    .unwrap_or(false);

    if is_everyone_eligible {
        let everyone: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM actor_groups \
             WHERE account_id = $1 AND type = 'managed' AND name = 'Everyone' \
             AND deleted_at IS NULL",
        )
        .bind(client.account_id.into_inner())
        .fetch_optional(pool)
        .await?;

        if let Some(id) = everyone {
            group_ids.push((ActorGroupId::new(id), None));
        }
    }

    if group_ids.is_empty() {
        return Ok(ClientHydration {
            policies: Vec::new(),
            resources: Vec::new(),
            memberships: group_ids,
        });
    }

    let group_uuids: Vec<Uuid> = group_ids.iter().map(|(g, _)| g.into_inner()).collect();

    let policy_rows = sqlx::query(
        "SELECT id, account_id, actor_group_id, resource_id, conditions, disabled_at, deleted_at \
         FROM policies \
         WHERE actor_group_id = ANY($1) AND deleted_at IS NULL",
    )
    .bind(&group_uuids)
    .fetch_all(pool)
    .await?;

    let mut policies = Vec::with_capacity(policy_rows.len());
    let mut resource_ids: Vec<Uuid> = Vec::new();
    for row in &policy_rows {
        let resource_id: Uuid = row.get("resource_id");
        if !resource_ids.contains(&resource_id) {
            resource_ids.push(resource_id);
        }
        let conditions_json: serde_json::Value = row.get("conditions");
        let conditions: Vec<PolicyCondition> =
            serde_json::from_value(conditions_json).unwrap_or_default();
        policies.push(Policy {
            id: crate::domain::PolicyId::new(row.get("id")),
            account_id: crate::domain::AccountId::new(row.get("account_id")),
            actor_group_id: ActorGroupId::new(row.get("actor_group_id")),
            resource_id: ResourceId::new(resource_id),
            conditions,
            disabled_at: row.get("disabled_at"),
            deleted_at: row.get("deleted_at"),
        });
    }

    let resources = if resource_ids.is_empty() {
        Vec::new()
    } else {
        sqlx::query(
            "SELECT id, account_id, site_id, type, address, address_description, ip_stack, \
             filters, deleted_at \
             FROM resources WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(&resource_ids)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| {
            let resource_type: String = row.get("type");
            let ip_stack: Option<String> = row.get("ip_stack");
            let filters_json: serde_json::Value = row.get("filters");
            let site_id: Option<Uuid> = row.get("site_id");
            let filters: Vec<ResourceFilter> =
                serde_json::from_value(filters_json).unwrap_or_default();
            Resource {
                id: ResourceId::new(row.get("id")),
                account_id: crate::domain::AccountId::new(row.get("account_id")),
                site_id: site_id.map(SiteId::new),
                resource_type: resource_type_of(&resource_type),
                address: row.get("address"),
                address_description: row.get("address_description"),
                ip_stack: ip_stack.as_deref().and_then(ip_stack_of),
                filters,
                deleted_at: row.get("deleted_at"),
            }
        })
        .collect()
    };

    Ok(ClientHydration {
        policies,
        resources,
        memberships: group_ids,
    })
}

/// The furthest-out expiry among the client's currently unexpired tokens
/// (spec §3: a policy's effective grant is bounded by the token that
/// authenticated the connection). `None` means no live token row, not
/// that the client is unauthenticated — callers only reach this after
/// PASETO verification already passed.
pub async fn fetch_active_token_expiry(
    pool: &PgPool,
    client_id: ClientId,
) -> Result<Option<DateTime<Utc>>> {
    let expiry: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT expires_at FROM tokens \
         WHERE client_id = $1 AND expires_at > now() \
         ORDER BY expires_at DESC LIMIT 1",
    )
    .bind(client_id.into_inner())
    .fetch_optional(pool)
    .await?;
    Ok(expiry)
}

/// Upserts a client's connection-time fields on socket join and returns
/// the persisted row, keyed by `(account_id, actor_id, external_id)` —
/// the same identity a client reconnects under across ip/version churn.
pub async fn upsert_client(
    pool: &PgPool,
    account_id: Uuid,
    actor_id: Uuid,
    external_id: &str,
    public_key: &str,
    ipv4: std::net::Ipv4Addr,
    ipv6: std::net::Ipv6Addr,
    user_agent: Option<&str>,
    version: &str,
) -> Result<ClientId> {
    let row = sqlx::query(
        "INSERT INTO clients \
           (id, account_id, actor_id, external_id, public_key, ipv4, ipv6, \
            last_seen_user_agent, last_seen_version, verified_at) \
         VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, now()) \
         ON CONFLICT (account_id, actor_id, external_id) DO UPDATE SET \
           public_key = EXCLUDED.public_key, \
           last_seen_user_agent = EXCLUDED.last_seen_user_agent, \
           last_seen_version = EXCLUDED.last_seen_version, \
           verified_at = now() \
         RETURNING id",
    )
    .bind(account_id)
    .bind(actor_id)
    .bind(external_id)
    .bind(public_key)
    .bind(ipv4.to_string())
    .bind(ipv6.to_string())
    .bind(user_agent)
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(ClientId::new(row.get("id")))
}
