//! # Tunnox Gateway Node
//!
//! A multi-tenant reverse-tunnel gateway: agents behind NAT attach over
//! TCP, WebSocket, QUIC, or an HTTP long-polling fallback; the node
//! authorizes port-mapping relationships between pairs of agents and
//! forwards their traffic, bridging across the cluster when the two
//! agents sit on different nodes.
//!
//! ## Modules
//!
//! - [`config`]    — tunables, JSON file + env overrides
//! - [`stream`]    — the packet-stream interface every transport exposes
//! - [`hlp`]       — the long-polling transport (processor, registry, endpoints)
//! - [`session`]   — connection lifecycle, packet dispatch, commands, fan-out
//! - [`bridge`]    — per-mapping tunnel bridges with bandwidth and conn caps
//! - [`cluster`]   — node links, pools, forward sessions, broker, correlator
//! - [`transport`] — native TCP / WebSocket / QUIC intake
//! - [`stores`]    — collaborator traits (auth, mappings, node registry)
//! - [`state`]     — wiring and the axum router
//! - [`api`]       — read-only REST endpoints
//! - [`error`]     — the gateway-wide error taxonomy

pub mod api;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hlp;
pub mod session;
pub mod state;
pub mod stores;
pub mod stream;
pub mod transport;
