//! # maclease
//!
//! A link-layer address leasing library: stations negotiate blocks of MAC
//! addresses with a server over raw Ethernet frames, much like DHCP hands
//! out IP addresses.
//!
//! ## Features
//!
//! - Full negotiation protocol: DISCOVER, OFFER, REQUEST, ACK, RELEASE,
//!   DEFEND, ANNOUNCE
//! - 48-bit and 64-bit address blocks, unicast and multicast, in count or
//!   prefix-mask form
//! - Self-assignment with conflict defense when no server answers
//! - Keyed-hash grant binding, so only the offered station can commit or
//!   release a block
//! - In-place lease renewal and alternate-block grants
//!
//! ## Quick Start
//!
//! ```no_run
//! use maclease::{Action, Client, ClientConfig};
//!
//! fn main() -> maclease::Result<()> {
//!     let config = ClientConfig::load_or_create("client.json")?;
//!     let mut client = Client::new(config);
//!     for action in client.start() {
//!         match action {
//!             Action::Send(pkt) => { /* transmit pkt.encode() */ }
//!             _ => { /* adjust interface addresses */ }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Packet`] - frame parsing, encoding, and legality checking
//! - [`AddrInterval`] - a contiguous block of addresses
//! - [`SetDatabase`] - interval database tracking free, reserved, and
//!   assigned blocks with timed expiry
//! - [`Client`] - discovery, requesting, bound, and defending states
//! - [`Server`] - offer, grant, and release handling over four pools
//! - [`ClientConfig`] / [`ServerConfig`] - JSON configuration

pub mod addrset;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod packet;
pub mod server;
pub mod timer;

pub use addrset::{AddrInterval, AddrWidth, IntervalForm};
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use database::SetDatabase;
pub use error::{Error, Result};
pub use packet::{MessageType, Packet, StatusCode};
pub use server::Server;

/// What the protocol asks its host to do. The state machines never touch
/// the network or the interface themselves; they hand these back instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transmit a frame.
    Send(Packet),
    /// Join the protocol's multicast group.
    JoinGroup,
    /// Leave the protocol's multicast group.
    LeaveGroup,
    /// Install an address on the interface.
    AddAddress(u64),
    /// Remove an address from the interface.
    RemoveAddress(u64),
}
