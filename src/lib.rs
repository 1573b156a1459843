//! Client engine for Nostr relay-based groups.
//!
//! Builds and signs events, keeps a group relay and a metadata relay
//! connected, and reconciles the user's joined-groups record across every
//! group relay they use.

pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod keys;
pub mod membership;
pub mod message;
pub mod model;
pub mod observable;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;

pub use config::Settings;
pub use error::{Error, Result};
pub use event::{Event, Tag};
pub use keys::KeyPair;
pub use membership::MembershipSync;
pub use relay::{ConnectionState, RelayConnection};
pub use session::Session;
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{Transport, WsTransport};
