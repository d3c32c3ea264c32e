//! Client WebSocket endpoint (`/socket/client`, spec §6).
//!
//! Mirrors the shape of the teacher's `websocket::handler`/chat-server
//! example: an HTTP handler does the upgrade, a per-connection task
//! owns the socket halves, and a channel actor owns everything else.
//! Here the actor is a [`ClientChannel`] instead of a chat room member.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use chrono::{DateTime, Utc};

use crate::client::channel::{ClientChannel, HydrateCache, RequestPrepareConnection};
use crate::client::repository::{fetch_active_token_expiry, hydrate_client, upsert_client, ClientHydration};
use crate::domain::{AccountId, ActorId, Client};
use crate::error::{Error, Result};
use crate::middleware::TokenValidator;
use crate::state::AppState;
use crate::transport::messages::{ClientToServer, ServerToClient};
use crate::transport::version::ProtocolVersion;

use super::common::{account_slug, relay_credentials};

pub async fn client_socket_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match prepare_session(&state, &params, &headers).await {
        Ok(session) => ws.on_upgrade(move |socket| run_session(socket, state, session)),
        Err(err) => err.into_response(),
    }
}

struct ClientSession {
    client: Client,
    version: ProtocolVersion,
    account_slug: String,
    hydration: ClientHydration,
    relays: Vec<crate::transport::messages::RelayCredential>,
    token_expires_at: Option<DateTime<Utc>>,
}

/// `sub` claims for this socket are `client:<account_id>:<actor_id>` —
/// this crate's extension of the teacher's `user:`/`client:` prefix
/// convention (`middleware::token::Claims`) to carry both ids a client
/// connection needs.
fn parse_client_subject(sub: &str) -> Result<(AccountId, ActorId)> {
    let rest = sub
        .strip_prefix("client:")
        .ok_or_else(|| Error::Unauthorized("expected a client token".to_string()))?;
    let (account, actor) = rest
        .split_once(':')
        .ok_or_else(|| Error::Unauthorized("malformed client token subject".to_string()))?;
    let account_id: AccountId = account
        .parse()
        .map_err(|_| Error::Unauthorized("malformed account id in token".to_string()))?;
    let actor_id: ActorId = actor
        .parse()
        .map_err(|_| Error::Unauthorized("malformed actor id in token".to_string()))?;
    Ok((account_id, actor_id))
}

async fn prepare_session(
    state: &AppState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<ClientSession> {
    let token = params
        .get("token")
        .ok_or_else(|| Error::Unauthorized("missing token query parameter".to_string()))?;
    let claims = state.paseto_auth().await?.validate_token(token)?;
    let (account_id, actor_id) = parse_client_subject(&claims.sub)?;

    let external_id = params
        .get("external_id")
        .cloned()
        .ok_or_else(|| Error::Unauthorized("missing external_id query parameter".to_string()))?;
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
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());

    let pool = state
        .db()
        .await
        .ok_or_else(|| Error::Internal("database pool unavailable".to_string()))?;

    let client_id = upsert_client(
        &pool,
        account_id.into_inner(),
        actor_id.into_inner(),
        &external_id,
        &public_key,
        ipv4,
        ipv6,
        user_agent,
        &version_str,
    )
    .await?;

    let client = Client {
        id: client_id,
        account_id,
        actor_id,
        external_id,
        public_key,
        ipv4,
        ipv6,
        last_seen_user_agent: user_agent.map(str::to_string),
        last_seen_version: version_str,
        verified_at: None,
        deleted_at: None,
    };

    let hydration = hydrate_client(&pool, &client).await?;
    let account_slug = account_slug(&pool, account_id.into_inner()).await?;
    let relays = relay_credentials(state.presence(), None);
    let token_expires_at = fetch_active_token_expiry(&pool, client_id).await?;

    Ok(ClientSession {
        client,
        version,
        account_slug,
        hydration,
        relays,
        token_expires_at,
    })
}

async fn run_session(socket: WebSocket, state: AppState, session: ClientSession) {
    let client_id = session.client.id;
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerToClient>();

    let handle = {
        let mut runtime = state.agent_runtime().lock().await;
        match ClientChannel::spawn(
            &mut runtime,
            &session.client,
            session.version,
            outbound_tx,
            state.pubsub().clone(),
            state.presence().clone(),
            state.channel_registry().clone(),
            state.signing_key_handle(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(client_id = %client_id, error = %err, "failed to spawn client channel");
                return;
            }
        }
    };

    handle
        .send(HydrateCache {
            account_slug: session.account_slug,
            policies: session.hydration.policies,
            resources: session.hydration.resources,
            memberships: session.hydration.memberships,
            relays: session.relays,
            token_expires_at: session.token_expires_at,
        })
        .await;

    let forward_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let is_disconnect = matches!(message, ServerToClient::Disconnect { .. });
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if is_disconnect {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientToServer>(&text) {
                Ok(ClientToServer::PrepareConnection { resource_id }) => {
                    handle
                        .send(RequestPrepareConnection {
                            resource_id,
                            preferred_gateway_id: None,
                            auth_provider_id: None,
                            remote_ip: None,
                            remote_ip_region: None,
                        })
                        .await;
                }
                Ok(ClientToServer::ReuseConnection { resource_id, gateway_id }) => {
                    handle
                        .send(RequestPrepareConnection {
                            resource_id,
                            preferred_gateway_id: Some(gateway_id),
                            auth_provider_id: None,
                            remote_ip: None,
                            remote_ip_region: None,
                        })
                        .await;
                }
                Err(err) => {
                    tracing::warn!(client_id = %client_id, error = %err, "malformed client frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(client_id = %client_id, error = %err, "client socket error");
                break;
            }
        }
    }

    forward_task.abort();
    tracing::info!(client_id = %client_id, "client socket closed");
}
