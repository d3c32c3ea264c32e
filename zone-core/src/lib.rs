//! # zone-core
//!
//! Control-plane core for a zero-trust network access gateway: a single
//! consumer tails the database's write-ahead log, classifies row changes
//! per table, and fans them out as typed domain events to per-connection
//! client and gateway caches; a policy evaluator picks the
//! longest-conforming grant for a (client, resource) pair and brokers a
//! peer-to-peer tunnel by rendezvous through the gateway's channel.
//!
//! ## Modules
//!
//! - [`wal`] — logical-replication consumer and change-log sink (spec §4.1, §4.2)
//! - [`hooks`] — per-table WAL decode and domain-event dispatch (spec §4.3)
//! - [`pubsub`] — process-local topic broker (spec L0)
//! - [`presence`] — gateway/relay presence registry and relay selection (spec §4.7)
//! - [`policy`] — pure policy-condition evaluator and longest-conforming selection (spec §4.6)
//! - [`client`] — per-client materialized cache and channel actor (spec §4.4)
//! - [`gateway`] — per-gateway flow cache, channel actor, and rendezvous (spec §4.5)
//! - [`transport`] — wire messages, protocol version gating, signed rendezvous refs
//! - [`sockets`] — axum WebSocket handlers bridging the two endpoints to the channel actors (spec §6)
//!
//! ## Example
//!
//! ```rust,no_run
//! use zone_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::builder()
//!         .config(config.clone())
//!         .build()
//!         .await?;
//!
//!     let app = Router::new()
//!         .route("/health", get(health))
//!         .route("/ready", get(readiness))
//!         .route("/socket/client", get(client_socket_handler))
//!         .route("/socket/gateway", get(gateway_socket_handler))
//!         .with_state(state);
//!
//!     Server::new(config).serve(app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod health;
pub mod pool_health;
pub mod server;
pub mod state;

pub mod domain;
pub mod pubsub;
pub mod presence;
pub mod policy;
pub mod transport;
pub mod client;
pub mod gateway;

#[cfg(feature = "replication")]
pub mod wal;

#[cfg(feature = "replication")]
pub mod hooks;

#[cfg(feature = "websocket")]
pub mod sockets;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "cache")]
pub mod cache;

#[cfg(feature = "events")]
pub mod events;

pub mod observability;

/// Internal agent-based components
///
/// Connection pool management is handled internally by agents. Users don't
/// need to interact with this module directly - build an [`AppState`](state::AppState)
/// via [`AppStateBuilder`](state::AppStateBuilder) and access pools via `state.db()`.
///
/// The only user-facing types from this module are:
/// - [`BackgroundWorker`](agents::BackgroundWorker) - for managed background tasks
///   (the WAL consumer's reconnect loop runs as one of these)
/// - [`TaskStatus`](agents::TaskStatus) - for checking background task status
/// - [`HealthStatus`](agents::HealthStatus) - for health check results
pub mod agents;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, RateLimitConfig, RouteRateLimitConfig};
    pub use crate::error::{Error, Result};
    pub use crate::health::{health, readiness, pool_metrics};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::pool_health::PoolHealthSummary;

    #[cfg(feature = "database")]
    pub use crate::pool_health::DatabasePoolHealth;

    #[cfg(feature = "cache")]
    pub use crate::pool_health::RedisPoolHealth;

    #[cfg(feature = "events")]
    pub use crate::pool_health::NatsClientHealth;

    pub use crate::middleware::{
        Claims, TokenValidator, PasetoAuth, RequestTrackingConfig,
        PROPAGATE_HEADERS, SENSITIVE_HEADERS,
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    };

    #[cfg(feature = "cache")]
    pub use crate::middleware::{TokenRevocation, RedisTokenRevocation};

    pub use crate::server::Server;
    pub use crate::state::{AppState, AppStateBuilder};

    #[cfg(feature = "observability")]
    pub use crate::observability::init_tracing;

    // Domain model, control-plane subsystems
    pub use crate::domain::*;
    pub use crate::pubsub::{DomainEvent, PubSub, SubscriberId, Topic};
    pub use crate::presence::{PresenceRegistry, SharedPresence};
    pub use crate::policy::{evaluate, longest_conforming, Decision, EvaluationContext};
    pub use crate::transport::{
        ChannelRegistry, ClientToServer, GatewayToServer, ServerToClient, ServerToGateway,
    };

    #[cfg(feature = "websocket")]
    pub use crate::sockets::{client_socket_handler, gateway_socket_handler};

    // Background task management (user-facing)
    pub use crate::agents::{BackgroundWorker, TaskStatus};

    // Health status types (for checking aggregated health)
    pub use crate::agents::{AggregatedHealthResponse, HealthStatus};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    // Re-export time utilities
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export futures utilities
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    // Re-export HTTP types
    pub use http::{Method, Uri};

    // Re-export acton-reactive prelude for actor system
    pub use acton_reactive::prelude::*;
}
