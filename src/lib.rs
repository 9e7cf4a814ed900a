//! PeerChat - Encrypted peer-to-peer messaging with blockchain identities
//!
//! Messages are encrypted per message with X25519 + ChaCha20-Poly1305, signed
//! with Ed25519, and delivered over direct LAN connections when a peer is
//! reachable, or through a blockchain relay otherwise.

mod types;
mod models;
mod keys;
mod crypto;
mod signature;
mod wire;
mod blockchain;
mod storage;
mod connection;
mod directory;
mod discovery;
mod conversation;
mod router;
mod contacts;
mod client;
mod logger;

pub use types::*;
pub use models::*;
pub use keys::*;
pub use crypto::*;
pub use signature::*;
pub use wire::*;
pub use blockchain::*;
pub use storage::*;
pub use connection::*;
pub use directory::*;
pub use discovery::*;
pub use conversation::*;
pub use router::*;
pub use contacts::*;
pub use client::*;
pub use logger::*;
