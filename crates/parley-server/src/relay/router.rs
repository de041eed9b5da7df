//! One-to-one message delivery.
//!
//! Delivery is fire-and-forget: a message for a user with no live session,
//! or whose socket is not ready, is dropped. A recipient that cannot take
//! the whole frame without waiting is treated as gone and its session torn
//! down; the loop never waits on a recipient.

use super::Relay;
use crate::connection::Connection;
use parley_core::envelope::fields::{DESTINATION, SENDER};
use parley_core::Envelope;
use tracing::{error, info, warn};

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody is logged in under the destination name.
    NoSession,
    /// The recipient's socket was unusable; its session has been ended.
    PeerLost,
}

impl Relay {
    /// Forward `envelope` unchanged to the connection bound to its `destination`.
    pub fn route(&mut self, envelope: &Envelope) -> Delivery {
        let destination = envelope.str_field(DESTINATION).unwrap_or_default();
        let sender = envelope.str_field(SENDER).unwrap_or_default();

        let Some(target) = self.registry.lookup(destination) else {
            warn!(sender, destination, "destination has no session, message dropped");
            return Delivery::NoSession;
        };

        let writable = self
            .connections
            .get(&target)
            .is_some_and(Connection::is_writable);
        if !writable {
            error!(sender, destination, "lost contact with recipient, message dropped");
            self.close_connection(target, "recipient not writable");
            return Delivery::PeerLost;
        }

        let Some(conn) = self.connections.get(&target) else {
            return Delivery::PeerLost;
        };
        match conn.try_send(envelope) {
            Ok(()) => {
                info!(sender, destination, "message relayed");
                Delivery::Delivered
            }
            Err(e) => {
                error!(sender, destination, error = %e, "relay to recipient failed");
                self.close_connection(target, "relay send failed");
                Delivery::PeerLost
            }
        }
    }
}
