//! # HTTP Long-Polling Transport
//!
//! Emulates a full-duplex, ordered packet stream over stateless HTTP
//! `push` / `poll` exchanges for agents behind networks that only allow
//! outbound HTTP:
//!
//! - [`processor`] — per-connection state machine exposing the packet
//!   stream interface to the session layer
//! - [`registry`]  — the process-wide connection-id → processor index
//! - [`handlers`]  — the stateless axum endpoints
//!
//! All continuity lives in the processor; the HTTP handlers themselves
//! keep no state between requests.

pub mod handlers;
pub mod processor;
pub mod registry;

pub use processor::{HlpProcessor, PollOutcome};
pub use registry::HlpRegistry;
