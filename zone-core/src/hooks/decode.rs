//! Typed decoders from a WAL [`RawRow`] to a domain entity (spec §4.3).
//!
//! One function per table, built entirely on the column accessors in
//! [`crate::wal::raw`]. Kept separate from the per-table hook modules so
//! the "how do I read this row" concern doesn't tangle with "what event
//! does this change produce".

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::domain::{
    Account, Actor, ActorGroup, ActorGroupType, ActorType, AuthProvider, Client, Flow,
    FilterProtocol, Gateway, GeoLocation, IpStack, Membership, Policy, PolicyCondition, Resource,
    ResourceFilter, ResourceType, Site,
};
use crate::domain::{
    AccountId, ActorGroupId, ActorId, AuthProviderId, ClientId, FlowId, GatewayId, MembershipId,
    PolicyId, ResourceId, SiteId, TokenId,
};
use crate::wal::raw::{
    optional_str, optional_timestamp, optional_uuid, required_bool, required_json, required_str,
    required_timestamp, required_uuid, RawRow, RowParseError,
};

fn parse_enum<T: Copy>(
    column: &'static str,
    value: &str,
    variants: &[(&str, T)],
) -> Result<T, RowParseError> {
    variants
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, v)| *v)
        .ok_or(RowParseError::Malformed {
            column,
            expected: "known enum variant",
            value: value.to_string(),
        })
}

fn required_parsed<T: FromStr>(
    row: &RawRow,
    name: &'static str,
    expected: &'static str,
) -> Result<T, RowParseError> {
    let raw = required_str(row, name)?;
    raw.parse().map_err(|_| RowParseError::Malformed {
        column: name,
        expected,
        value: raw.to_string(),
    })
}

fn optional_f64(row: &RawRow, name: &'static str) -> Result<Option<f64>, RowParseError> {
    match optional_str(row, name)? {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| RowParseError::Malformed {
            column: name,
            expected: "f64",
            value: raw.to_string(),
        }),
    }
}

pub fn decode_account(row: &RawRow) -> Result<Account, RowParseError> {
    Ok(Account {
        id: AccountId::new(required_uuid(row, "id")?),
        slug: required_str(row, "slug")?.to_string(),
        name: required_str(row, "name")?.to_string(),
        features: crate::wal::raw::required_text_array(row, "features").unwrap_or_default(),
        disabled_at: optional_timestamp(row, "disabled_at")?,
        deleted_at: optional_timestamp(row, "deleted_at")?,
    })
}

pub fn decode_actor(row: &RawRow) -> Result<Actor, RowParseError> {
    let actor_type = required_str(row, "type")?;
    Ok(Actor {
        id: ActorId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        actor_type: parse_enum(
            "type",
            actor_type,
            &[
                ("admin", ActorType::Admin),
                ("user", ActorType::User),
                ("service_account", ActorType::ServiceAccount),
            ],
        )?,
        disabled_at: optional_timestamp(row, "disabled_at")?,
    })
}

pub fn decode_actor_group(row: &RawRow) -> Result<ActorGroup, RowParseError> {
    let group_type = required_str(row, "type")?;
    Ok(ActorGroup {
        id: ActorGroupId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        group_type: parse_enum(
            "type",
            group_type,
            &[
                ("managed", ActorGroupType::Managed),
                ("directory", ActorGroupType::Directory),
            ],
        )?,
        name: required_str(row, "name")?.to_string(),
        directory: optional_str(row, "directory")?.map(str::to_string),
        idp_id: optional_str(row, "idp_id")?.map(str::to_string),
        deleted_at: optional_timestamp(row, "deleted_at")?,
    })
}

pub fn decode_membership(row: &RawRow) -> Result<Membership, RowParseError> {
    Ok(Membership {
        id: MembershipId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        actor_id: ActorId::new(required_uuid(row, "actor_id")?),
        group_id: ActorGroupId::new(required_uuid(row, "group_id")?),
        last_synced_at: optional_timestamp(row, "last_synced_at")?,
    })
}

pub fn decode_client(row: &RawRow) -> Result<Client, RowParseError> {
    Ok(Client {
        id: ClientId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        actor_id: ActorId::new(required_uuid(row, "actor_id")?),
        external_id: required_str(row, "external_id")?.to_string(),
        public_key: required_str(row, "public_key")?.to_string(),
        ipv4: required_parsed::<Ipv4Addr>(row, "ipv4", "ipv4 address")?,
        ipv6: required_parsed::<Ipv6Addr>(row, "ipv6", "ipv6 address")?,
        last_seen_user_agent: optional_str(row, "last_seen_user_agent")?.map(str::to_string),
        last_seen_version: required_str(row, "last_seen_version")?.to_string(),
        verified_at: optional_timestamp(row, "verified_at")?,
        deleted_at: optional_timestamp(row, "deleted_at")?,
    })
}

pub fn decode_gateway(row: &RawRow) -> Result<Gateway, RowParseError> {
    let lat = optional_f64(row, "last_seen_location_lat")?;
    let lon = optional_f64(row, "last_seen_location_lon")?;
    let last_seen_location = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(GeoLocation { lat, lon }),
        _ => None,
    };

    Ok(Gateway {
        id: GatewayId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        site_id: SiteId::new(required_uuid(row, "site_id")?),
        external_id: required_str(row, "external_id")?.to_string(),
        public_key: required_str(row, "public_key")?.to_string(),
        ipv4: required_parsed::<Ipv4Addr>(row, "ipv4", "ipv4 address")?,
        ipv6: required_parsed::<Ipv6Addr>(row, "ipv6", "ipv6 address")?,
        last_seen_version: required_str(row, "last_seen_version")?.to_string(),
        last_seen_location,
        deleted_at: optional_timestamp(row, "deleted_at")?,
    })
}

pub fn decode_site(row: &RawRow) -> Result<Site, RowParseError> {
    Ok(Site {
        id: SiteId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        name: required_str(row, "name")?.to_string(),
    })
}

pub fn decode_resource(row: &RawRow) -> Result<Resource, RowParseError> {
    let resource_type = required_str(row, "type")?;
    let ip_stack = optional_str(row, "ip_stack")?
        .map(|v| {
            parse_enum(
                "ip_stack",
                v,
                &[
                    ("ipv4", IpStack::Ipv4),
                    ("ipv6", IpStack::Ipv6),
                    ("dual", IpStack::Dual),
                ],
            )
        })
        .transpose()?;

    let filters_json = required_json(row, "filters")?;
    let filters: Vec<ResourceFilter> = serde_json::from_value(filters_json)
        .map_err(|_| RowParseError::Malformed {
            column: "filters",
            expected: "json array of resource filters",
            value: "filters".to_string(),
        })?
        .into_iter()
        .map(|raw: RawFilter| ResourceFilter {
            protocol: raw.protocol,
            ports: raw.ports,
        })
        .collect();

    Ok(Resource {
        id: ResourceId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        site_id: optional_uuid(row, "site_id")?.map(SiteId::new),
        resource_type: parse_enum(
            "type",
            resource_type,
            &[
                ("dns", ResourceType::Dns),
                ("cidr", ResourceType::Cidr),
                ("ip", ResourceType::Ip),
                ("internet", ResourceType::Internet),
            ],
        )?,
        address: required_str(row, "address")?.to_string(),
        address_description: optional_str(row, "address_description")?.map(str::to_string),
        ip_stack,
        filters,
        deleted_at: optional_timestamp(row, "deleted_at")?,
    })
}

#[derive(serde::Deserialize)]
struct RawFilter {
    protocol: FilterProtocol,
    ports: Vec<String>,
}

pub fn decode_policy(row: &RawRow) -> Result<Policy, RowParseError> {
    let conditions_json = required_json(row, "conditions")?;
    let conditions: Vec<PolicyCondition> =
        serde_json::from_value(conditions_json).map_err(|_| RowParseError::Malformed {
            column: "conditions",
            expected: "json array of conditions",
            value: "conditions".to_string(),
        })?;

    Ok(Policy {
        id: PolicyId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        actor_group_id: ActorGroupId::new(required_uuid(row, "actor_group_id")?),
        resource_id: ResourceId::new(required_uuid(row, "resource_id")?),
        conditions,
        disabled_at: optional_timestamp(row, "disabled_at")?,
        deleted_at: optional_timestamp(row, "deleted_at")?,
    })
}

pub fn decode_flow(row: &RawRow) -> Result<Flow, RowParseError> {
    Ok(Flow {
        id: FlowId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
        policy_id: PolicyId::new(required_uuid(row, "policy_id")?),
        actor_group_membership_id: MembershipId::new(required_uuid(
            row,
            "actor_group_membership_id",
        )?),
        token_id: TokenId::new(required_uuid(row, "token_id")?),
        client_id: ClientId::new(required_uuid(row, "client_id")?),
        gateway_id: GatewayId::new(required_uuid(row, "gateway_id")?),
        resource_id: ResourceId::new(required_uuid(row, "resource_id")?),
        expires_at: required_timestamp(row, "expires_at")?,
    })
}

pub fn decode_auth_provider(row: &RawRow) -> Result<AuthProvider, RowParseError> {
    Ok(AuthProvider {
        id: AuthProviderId::new(required_uuid(row, "id")?),
        account_id: AccountId::new(required_uuid(row, "account_id")?),
    })
}

/// `disabled_at` on auth_providers, read without decoding the whole
/// struct (the struct itself has no `disabled_at` field — it's transient
/// WAL-only state, not part of the cached domain shape).
pub fn auth_provider_disabled(row: &RawRow) -> Result<bool, RowParseError> {
    Ok(optional_timestamp(row, "disabled_at")?.is_some())
}

pub fn required_flag(row: &RawRow, name: &'static str) -> Result<bool, RowParseError> {
    required_bool(row, name)
}
