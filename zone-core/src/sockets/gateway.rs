//! Gateway WebSocket endpoint (`/socket/gateway`, spec §6).
//!
//! Structurally identical to [`super::client`]: upgrade, spawn a channel
//! actor, hydrate it, then bridge socket frames to/from its mailbox.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};

use crate::domain::{AccountId, Gateway};
use crate::error::{Error, Result};
use crate::gateway::channel::{GatewayChannel, HydrateCache, ReportFlowAuthorized};
use crate::gateway::repository::{hydrate_gateway, resolve_site, upsert_gateway};
use crate::middleware::TokenValidator;
use crate::state::AppState;
use crate::transport::messages::{GatewayToServer, ServerToGateway};
use crate::transport::version::ProtocolVersion;

use super::common::{account_slug, relay_credentials};

pub async fn gateway_socket_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    match prepare_session(&state, &params).await {
        Ok(session) => ws.on_upgrade(move |socket| run_session(socket, state, session)),
        Err(err) => err.into_response(),
    }
}

struct GatewaySession {
    gateway: Gateway,
    version: ProtocolVersion,
    account_slug: String,
    entries: Vec<(
        crate::domain::ClientId,
        crate::domain::ResourceId,
        crate::domain::FlowId,
        i64,
    )>,
    relays: Vec<crate::transport::messages::RelayCredential>,
}

/// `sub` claims for this socket are `gateway:<account_id>` — a gateway
/// token authorizes a site's gateways as a group, not one gateway row,
/// mirroring the `user:`/`client:` prefix convention in
/// `middleware::token::Claims`.
fn parse_gateway_subject(sub: &str) -> Result<AccountId> {
    sub.strip_prefix("gateway:")
        .ok_or_else(|| Error::Unauthorized("expected a gateway token".to_string()))?
        .parse()
        .map_err(|_| Error::Unauthorized("malformed account id in token".to_string()))
}

async fn prepare_session(state: &AppState, params: &HashMap<String, String>) -> Result<GatewaySession> {
    let token = params
        .get("token")
        .ok_or_else(|| Error::Unauthorized("missing token query parameter".to_string()))?;
    let claims = state.paseto_auth().await?.validate_token(token)?;
    let account_id = parse_gateway_subject(&claims.sub)?;

    let external_id = params
        .get("external_id")
        .cloned()
        .ok_or_else(|| Error::Unauthorized("missing external_id query parameter".to_string()))?;
    let site_name = params
        .get("name")
        .cloned()
        .ok_or_else(|| Error::Unauthorized("missing name query parameter".to_string()))?;
    let public_key = params
        .get("public_key")
        .cloned()
        .ok_or_else(|| Error::Unauthorized("missing public_key query parameter".to_string()))?;
    if public_key.len() != 44 {
        return Err(Error::Unauthorized(
            "public_key must be 44 characters (base64 WireGuard key)".to_string(),
        ));
    }
    let version_str = params.get("version").cloned().unwrap_or_default();
    let version: ProtocolVersion = version_str.parse().unwrap_or(ProtocolVersion::new(0, 0, 0));

    let ipv4: Ipv4Addr = params
        .get("ipv4")
        .and_then(|v| v.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let ipv6: Ipv6Addr = params
        .get("ipv6")
        .and_then(|v| v.parse().ok())
        .unwrap_or(Ipv6Addr::UNSPECIFIED);

    let pool = state
        .db()
        .await
        .ok_or_else(|| Error::Internal("database pool unavailable".to_string()))?;

    let site_id = resolve_site(&pool, account_id.into_inner(), &site_name).await?;
    let gateway_id = upsert_gateway(
        &pool,
        account_id.into_inner(),
        site_id,
        &external_id,
        &public_key,
        &version_str,
        ipv4,
        ipv6,
    )
    .await?;

    let gateway = Gateway {
        id: gateway_id,
        account_id,
        site_id,
        external_id,
        public_key,
        ipv4,
        ipv6,
        last_seen_version: version_str,
        last_seen_location: None,
        deleted_at: None,
    };

    let entries = hydrate_gateway(&pool, gateway_id).await?;
    let account_slug = account_slug(&pool, account_id.into_inner()).await?;
    let relays = relay_credentials(state.presence(), None);

    Ok(GatewaySession {
        gateway,
        version,
        account_slug,
        entries,
        relays,
    })
}

async fn run_session(socket: WebSocket, state: AppState, session: GatewaySession) {
    let gateway_id = session.gateway.id;
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerToGateway>();
    let close = Arc::new(Notify::new());

    let handle = {
        let mut runtime = state.agent_runtime().lock().await;
        match GatewayChannel::spawn(
            &mut runtime,
            &session.gateway,
            session.version,
            outbound_tx,
            state.pubsub().clone(),
            state.presence().clone(),
            state.channel_registry().clone(),
            state.signing_key_handle(),
            close.clone(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(gateway_id = %gateway_id, error = %err, "failed to spawn gateway channel");
                return;
            }
        }
    };

    handle
        .send(HydrateCache {
            account_slug: session.account_slug,
            entries: session.entries,
            relays: session.relays,
        })
        .await;

    let forward_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = close.notified() => {
                break;
            }
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<GatewayToServer>(&text) {
                        Ok(GatewayToServer::FlowAuthorized { reference }) => {
                            handle.send(ReportFlowAuthorized { reference }).await;
                        }
                        Ok(GatewayToServer::BroadcastIceCandidates { .. })
                        | Ok(GatewayToServer::BroadcastInvalidatedIceCandidates { .. })
                        | Ok(GatewayToServer::ConnectionReady { .. }) => {
                            tracing::debug!(
                                gateway_id = %gateway_id,
                                "ICE relay frame received; not yet bridged to client channels"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(gateway_id = %gateway_id, error = %err, "malformed gateway frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(gateway_id = %gateway_id, error = %err, "gateway socket error");
                        break;
                    }
                }
            }
        }
    }

    forward_task.abort();
    tracing::info!(gateway_id = %gateway_id, "gateway socket closed");
}
