//! # Tunnox Wire Protocol
//!
//! Shared wire types for the tunnox reverse-tunnel gateway. Everything an
//! agent and a server node need to talk to each other lives here:
//!
//! - [`packet`]   — transfer packet envelope, command packets, typed payloads
//! - [`codec`]    — length-prefixed binary encoding of transfer packets
//! - [`fragment`] — splitting oversize payloads and reassembling them
//! - [`envelope`] — the HTTP long-polling tunnel package (`X-Tunnel-Package`)
//! - [`cluster`]  — node-to-node frames for the cross-node stream bridge
//!
//! The crate is deliberately runtime-free: no async, no I/O. Servers and
//! agents drive these types from their own event loops.

pub mod cluster;
pub mod codec;
pub mod envelope;
pub mod fragment;
pub mod packet;

pub use codec::{decode, encode, CodecError};
pub use envelope::{TunnelPackage, TunnelType};
pub use fragment::{Fragment, FragmentError, Reassembler, ReassemblyOutcome};
pub use packet::{CommandPacket, CommandType, PacketType, TransferPacket};
