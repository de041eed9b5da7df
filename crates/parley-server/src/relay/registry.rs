//! Session registry: which username is logged in on which connection.
//!
//! Both directions are indexed so that a connection appears in at most one
//! entry and a username maps to at most one connection. The registry is
//! owned by the event loop and mutated only from it.

use crate::connection::ConnId;
use parley_core::{ParleyError, ParleyResult};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_name: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `username` to `conn`.
    ///
    /// Re-binding the same pair is a no-op. Fails with `DuplicateSession` if
    /// either side is already bound to something else.
    pub fn bind(&mut self, username: &str, conn: ConnId) -> ParleyResult<()> {
        match self.by_name.get(username) {
            Some(&existing) if existing == conn => return Ok(()),
            Some(_) => {
                return Err(ParleyError::DuplicateSession(username.to_string()));
            }
            None => {}
        }
        if let Some(other) = self.by_conn.get(&conn) {
            return Err(ParleyError::DuplicateSession(format!(
                "connection {conn} already bound to {other}"
            )));
        }

        self.by_name.insert(username.to_string(), conn);
        self.by_conn.insert(conn, username.to_string());
        info!(username, conn, "session bound");
        Ok(())
    }

    /// Remove the entry for `username`, returning its connection.
    pub fn unbind(&mut self, username: &str) -> Option<ConnId> {
        let conn = self.by_name.remove(username)?;
        self.by_conn.remove(&conn);
        debug!(username, conn, "session unbound");
        Some(conn)
    }

    /// Remove whatever session `conn` carries, returning its username.
    pub fn unbind_connection(&mut self, conn: ConnId) -> Option<String> {
        let username = self.by_conn.remove(&conn)?;
        self.by_name.remove(&username);
        debug!(username = %username, conn, "session unbound");
        Some(username)
    }

    pub fn lookup(&self, username: &str) -> Option<ConnId> {
        self.by_name.get(username).copied()
    }

    /// Username bound to `conn`, if it has logged in.
    pub fn username_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    /// Every bound username, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connections that currently carry a session.
    pub fn connections(&self) -> Vec<ConnId> {
        self.by_conn.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_lookup() {
        let mut reg = SessionRegistry::new();
        reg.bind("alice", 1).unwrap();
        assert_eq!(reg.lookup("alice"), Some(1));
        assert_eq!(reg.username_of(1), Some("alice"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn second_connection_for_same_name_rejected() {
        let mut reg = SessionRegistry::new();
        reg.bind("alice", 1).unwrap();
        let err = reg.bind("alice", 2).unwrap_err();
        assert!(matches!(err, ParleyError::DuplicateSession(_)));
        assert_eq!(reg.lookup("alice"), Some(1));
        assert_eq!(reg.username_of(2), None);
    }

    #[test]
    fn connection_carries_one_name() {
        let mut reg = SessionRegistry::new();
        reg.bind("alice", 1).unwrap();
        assert!(reg.bind("bob", 1).is_err());
        assert_eq!(reg.lookup("bob"), None);
    }

    #[test]
    fn rebinding_same_pair_is_noop() {
        let mut reg = SessionRegistry::new();
        reg.bind("alice", 1).unwrap();
        reg.bind("alice", 1).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unbind_clears_both_sides() {
        let mut reg = SessionRegistry::new();
        reg.bind("alice", 1).unwrap();
        reg.bind("bob", 2).unwrap();

        assert_eq!(reg.unbind("alice"), Some(1));
        assert_eq!(reg.username_of(1), None);
        assert_eq!(reg.unbind("alice"), None);

        assert_eq!(reg.unbind_connection(2), Some("bob".to_string()));
        assert_eq!(reg.lookup("bob"), None);
        assert!(reg.is_empty());

        // Freed name can be bound again elsewhere.
        reg.bind("alice", 3).unwrap();
        assert_eq!(reg.usernames(), vec!["alice".to_string()]);
    }
}
