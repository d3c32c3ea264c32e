//! The two WebSocket endpoints (spec §6): socket join, per-connection
//! channel actor spawn, and frame bridging. Everything upstream of this
//! module (caches, policy, rendezvous) is pure or DB-only; this is
//! where it all gets wired to an actual client or gateway socket.

mod common;

pub mod client;
pub mod gateway;

pub use client::client_socket_handler;
pub use gateway::gateway_socket_handler;
