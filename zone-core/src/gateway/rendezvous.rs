//! Rendezvous protocol: brokering a client/gateway connection (spec §4.5).

use chrono::{DateTime, Utc};

use crate::domain::{ClientId, ResourceId, ResourceType};
use crate::transport::messages::{IceCredentials, ResourceWire, ServerToGateway};
use crate::transport::ref_token::{encode_ref, RefClaims};
use crate::transport::version::{gateway_supports_rendezvous, ProtocolVersion};

/// Everything needed to build the `authorize_flow` push to a gateway.
pub struct RendezvousRequest {
    pub client_id: ClientId,
    pub client_public_key: String,
    pub resource: ResourceWire,
    pub resource_type: ResourceType,
    pub preshared_key: String,
    pub ice_credentials: IceCredentials,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Gateways below v1.4 collapse a bare `ip` resource to a `/32` CIDR;
/// newer gateways understand `ip` resources directly.
#[must_use]
pub fn rewrite_resource_for_version(mut resource: ResourceWire, resource_type: ResourceType, gateway_version: ProtocolVersion) -> ResourceWire {
    if resource_type == ResourceType::Ip && !gateway_supports_rendezvous(gateway_version) {
        if resource.address.contains(':') {
            resource.address = format!("{}/128", resource.address);
        } else {
            resource.address = format!("{}/32", resource.address);
        }
    }
    resource
}

/// Build the signed `ref` and the `authorize_flow` message to push to
/// the gateway's socket.
#[must_use]
pub fn build_authorize_flow(secret: &[u8], request: RendezvousRequest) -> ServerToGateway {
    let claims = RefClaims {
        client_channel_id: request.client_id,
        resource_id: parse_resource_id(&request.resource),
        preshared_key: request.preshared_key.clone(),
        ice_ufrag: request.ice_credentials.ufrag.clone(),
        ice_pwd: request.ice_credentials.pwd.clone(),
        issued_at: Utc::now().timestamp(),
    };
    let reference = encode_ref(secret, &claims);

    ServerToGateway::AuthorizeFlow {
        reference,
        resource: request.resource,
        client_id: request.client_id,
        client_public_key: request.client_public_key,
        ice_credentials: request.ice_credentials,
        preshared_key: request.preshared_key,
        expires_at: request.expires_at,
    }
}

fn parse_resource_id(resource: &ResourceWire) -> ResourceId {
    resource.id
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn resource() -> ResourceWire {
        ResourceWire {
            id: ResourceId::new(Uuid::new_v4()),
            resource_type: "ip".into(),
            address: "10.0.0.5".into(),
            address_description: None,
            name: "db".into(),
        }
    }

    #[test]
    fn legacy_gateway_collapses_ip_to_cidr() {
        let old = ProtocolVersion::new(1, 3, 0);
        let rewritten = rewrite_resource_for_version(resource(), ResourceType::Ip, old);
        assert_eq!(rewritten.address, "10.0.0.5/32");
    }

    #[test]
    fn modern_gateway_keeps_bare_ip() {
        let modern = ProtocolVersion::new(1, 4, 0);
        let rewritten = rewrite_resource_for_version(resource(), ResourceType::Ip, modern);
        assert_eq!(rewritten.address, "10.0.0.5");
    }

    #[test]
    fn authorize_flow_ref_round_trips_through_decode() {
        let secret = b"service-secret";
        let client_id = ClientId::new(Uuid::new_v4());
        let req = RendezvousRequest {
            client_id,
            client_public_key: "pub".into(),
            resource: resource(),
            resource_type: ResourceType::Ip,
            preshared_key: "psk".into(),
            ice_credentials: IceCredentials { ufrag: "uf".into(), pwd: "pw".into() },
            expires_at: None,
        };
        let resource_id = req.resource.id;
        let message = build_authorize_flow(secret, req);
        match message {
            ServerToGateway::AuthorizeFlow { reference, .. } => {
                let decoded = crate::transport::ref_token::decode_ref(secret, &reference).unwrap();
                assert_eq!(decoded.client_channel_id, client_id);
                assert_eq!(decoded.resource_id, resource_id);
            }
            _ => panic!("expected AuthorizeFlow"),
        }
    }
}
