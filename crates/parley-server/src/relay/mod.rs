//! Relay state owned by the event loop: live connections, the session
//! registry, and the user directory, plus the teardown paths every
//! component shares.

pub mod registry;
pub mod router;

pub use registry::SessionRegistry;
pub use router::Delivery;

use crate::auth::LoginThrottle;
use crate::connection::{ConnId, Connection, LoginState};
use crate::directory::UserDirectory;
use parley_core::{Envelope, ResponseCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Relay {
    pub(crate) connections: HashMap<ConnId, Connection>,
    pub(crate) registry: SessionRegistry,
    pub(crate) directory: Arc<dyn UserDirectory>,
    pub(crate) throttle: LoginThrottle,
    pub(crate) io_timeout: Duration,
}

impl Relay {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        throttle: LoginThrottle,
        io_timeout: Duration,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            registry: SessionRegistry::new(),
            directory,
            throttle,
            io_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_live(&self, id: ConnId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Close `id`, ending the session it carries (if any).
    ///
    /// A bound session is unbound and its logout recorded in the directory.
    pub fn close_connection(&mut self, id: ConnId, reason: &str) {
        if let Some(username) = self.registry.unbind_connection(id) {
            if let Err(e) = self.directory.record_logout(&username) {
                warn!(username = %username, error = %e, "failed to record logout");
            }
            info!(username = %username, conn = id, reason, "session ended");
        }
        if let Some(conn) = self.connections.remove(&id) {
            debug!(conn = id, peer = %conn.peer(), reason, "connection closed");
        }
    }

    /// Send `envelope` to `id`. A failed send drops that peer.
    ///
    /// Returns whether the envelope went out.
    pub async fn reply(&mut self, id: ConnId, envelope: Envelope) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        let result = conn.send(&envelope).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                if e.is_peer_loss() {
                    debug!(conn = id, error = %e, "peer gone");
                } else {
                    warn!(conn = id, error = %e, "send failed, dropping peer");
                }
                self.close_connection(id, "send failed");
                false
            }
        }
    }

    /// Push an unsolicited envelope to `id` without waiting on its socket.
    ///
    /// A peer that cannot take it right away is dropped.
    pub fn push(&mut self, id: ConnId, envelope: &Envelope) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        match conn.try_send(envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = id, error = %e, "push failed, dropping peer");
                self.close_connection(id, "push failed");
                false
            }
        }
    }

    /// Push an unsolicited 205 to every logged-in session.
    pub fn broadcast_contacts_changed(&mut self) -> usize {
        let update = Envelope::response(ResponseCode::ContactsChanged);
        let mut notified = 0;
        for id in self.registry.connections() {
            if self.push(id, &update) {
                notified += 1;
            }
        }
        info!(notified, "contact list update broadcast");
        notified
    }

    /// Close connections whose login challenge went unanswered past its deadline.
    pub fn expire_challenges(&mut self, now: Instant) {
        let expired: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| matches!(c.state(), LoginState::ChallengeSent(p) if p.is_expired(now)))
            .map(Connection::id)
            .collect();

        for id in expired {
            warn!(conn = id, "login challenge timed out");
            self.close_connection(id, "challenge timed out");
        }
    }

    /// Close everything (shutdown).
    pub fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, "server shutdown");
        }
    }
}
