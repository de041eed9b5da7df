//! parley-client: async client library for the parley chat relay.
//!
//! ```no_run
//! use parley_client::ParleyClient;
//! use std::time::Duration;
//!
//! # async fn example() -> parley_core::ParleyResult<()> {
//! let mut client = ParleyClient::connect("127.0.0.1:7777", Duration::from_secs(5)).await?;
//! client.login("alice", "wonderland", "alice-public-key").await?;
//! client.send_message("bob", "hello").await?;
//!
//! let pushed = client.next_incoming().await?;
//! println!("{:?}", pushed);
//! client.exit().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::ParleyClient;

pub use parley_core::{Envelope, ParleyError, ParleyResult};
