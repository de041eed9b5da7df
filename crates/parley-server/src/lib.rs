//! parley-server: authenticated store-and-forward chat relay.
//!
//! Clients log in with a challenge-response handshake, then exchange
//! messages and manage contact lists through a single event loop that owns
//! every connection.

pub mod auth;
pub mod config;
pub mod connection;
pub mod directory;
pub mod dispatch;
pub mod handshake;
pub mod relay;
pub mod server;

pub use config::{ServerConfig, UserSeed};
pub use directory::{MemoryDirectory, UserDirectory};
pub use server::{RelayHandle, RelayServer, ServerCommand};
