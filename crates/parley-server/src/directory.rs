//! User directory: the store of registered users, contact lists, and
//! login/message accounting the relay consults.
//!
//! The relay only talks to [`UserDirectory`]; a database-backed service can
//! implement it. [`MemoryDirectory`] keeps everything in process and also
//! answers the operator queries (active users, login history, message
//! statistics).

use crate::config::UserSeed;
use parley_core::{derive_password_secret, ParleyError, ParleyResult};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::debug;

/// Operations the relay needs from the user store.
pub trait UserDirectory: Send + Sync {
    /// Whether `name` is a registered user.
    fn user_exists(&self, name: &str) -> ParleyResult<bool>;

    /// Stored password secret for `name` (HMAC key for login digests).
    fn password_secret(&self, name: &str) -> ParleyResult<Vec<u8>>;

    /// Record a successful login and the key the client presented.
    fn record_login(
        &self,
        name: &str,
        ip: IpAddr,
        port: u16,
        public_key: &str,
    ) -> ParleyResult<()>;

    fn record_logout(&self, name: &str) -> ParleyResult<()>;

    fn contacts_of(&self, name: &str) -> ParleyResult<Vec<String>>;

    /// Add `contact` to `user`'s list. Unknown contacts and duplicates are ignored.
    fn add_contact(&self, user: &str, contact: &str) -> ParleyResult<()>;

    /// Remove `contact` from `user`'s list. Absent pairs are ignored.
    fn remove_contact(&self, user: &str, contact: &str) -> ParleyResult<()>;

    fn all_usernames(&self) -> ParleyResult<Vec<String>>;

    fn public_key_of(&self, name: &str) -> ParleyResult<Option<String>>;

    /// Count one message from `sender` to `recipient`.
    fn record_message_sent(&self, sender: &str, recipient: &str) -> ParleyResult<()>;
}

/// A user currently logged in, as the directory last heard.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveUser {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub login_time: SystemTime,
}

/// A registered user as listed for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownUser {
    pub name: String,
    pub last_login: Option<SystemTime>,
}

/// One row of login history.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRecord {
    pub name: String,
    pub time: SystemTime,
    pub ip: IpAddr,
    pub port: u16,
}

/// Per-user message counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub name: String,
    pub last_login: Option<SystemTime>,
    pub sent: u64,
    pub accepted: u64,
}

#[derive(Debug)]
struct UserRecord {
    secret: String,
    public_key: Option<String>,
    last_login: Option<SystemTime>,
    sent: u64,
    accepted: u64,
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: BTreeMap<String, UserRecord>,
    active: BTreeMap<String, ActiveUser>,
    history: Vec<LoginRecord>,
    contacts: BTreeSet<(String, String)>,
}

/// In-process [`UserDirectory`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated from config `[[users]]` entries.
    pub fn from_seeds(seeds: &[UserSeed]) -> Self {
        let dir = Self::new();
        for seed in seeds {
            dir.add_user(&seed.name, &seed.password);
        }
        dir
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `name`, deriving its password secret from `password`.
    pub fn add_user(&self, name: &str, password: &str) {
        self.add_user_with_secret(name, derive_password_secret(name, password));
    }

    /// Register `name` with an already-derived password secret.
    pub fn add_user_with_secret(&self, name: &str, secret: String) {
        let mut state = self.state();
        state.users.insert(
            name.to_string(),
            UserRecord {
                secret,
                public_key: None,
                last_login: None,
                sent: 0,
                accepted: 0,
            },
        );
        debug!(user = name, "user registered");
    }

    /// Delete `name` and everything that refers to it.
    pub fn remove_user(&self, name: &str) {
        let mut state = self.state();
        state.users.remove(name);
        state.active.remove(name);
        state.history.retain(|r| r.name != name);
        state.contacts.retain(|(u, c)| u != name && c != name);
    }

    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.state().active.values().cloned().collect()
    }

    /// Every registered user with the time of their last login.
    pub fn known_users(&self) -> Vec<KnownUser> {
        self.state()
            .users
            .iter()
            .map(|(name, u)| KnownUser {
                name: name.clone(),
                last_login: u.last_login,
            })
            .collect()
    }

    /// Login history for one user, or for everyone.
    pub fn login_history(&self, name: Option<&str>) -> Vec<LoginRecord> {
        self.state()
            .history
            .iter()
            .filter(|r| name.map_or(true, |n| r.name == n))
            .cloned()
            .collect()
    }

    pub fn message_stats(&self) -> Vec<MessageStats> {
        self.state()
            .users
            .iter()
            .map(|(name, u)| MessageStats {
                name: name.clone(),
                last_login: u.last_login,
                sent: u.sent,
                accepted: u.accepted,
            })
            .collect()
    }
}

impl UserDirectory for MemoryDirectory {
    fn user_exists(&self, name: &str) -> ParleyResult<bool> {
        Ok(self.state().users.contains_key(name))
    }

    fn password_secret(&self, name: &str) -> ParleyResult<Vec<u8>> {
        self.state()
            .users
            .get(name)
            .map(|u| u.secret.as_bytes().to_vec())
            .ok_or_else(|| ParleyError::UnknownUser(name.to_string()))
    }

    fn record_login(
        &self,
        name: &str,
        ip: IpAddr,
        port: u16,
        public_key: &str,
    ) -> ParleyResult<()> {
        let mut state = self.state();
        let now = SystemTime::now();
        let user = state
            .users
            .get_mut(name)
            .ok_or_else(|| ParleyError::UnknownUser(name.to_string()))?;
        user.last_login = Some(now);
        if user.public_key.as_deref() != Some(public_key) {
            user.public_key = Some(public_key.to_string());
        }
        state.active.insert(
            name.to_string(),
            ActiveUser {
                name: name.to_string(),
                ip,
                port,
                login_time: now,
            },
        );
        state.history.push(LoginRecord {
            name: name.to_string(),
            time: now,
            ip,
            port,
        });
        Ok(())
    }

    fn record_logout(&self, name: &str) -> ParleyResult<()> {
        self.state().active.remove(name);
        Ok(())
    }

    fn contacts_of(&self, name: &str) -> ParleyResult<Vec<String>> {
        Ok(self
            .state()
            .contacts
            .iter()
            .filter(|(u, _)| u == name)
            .map(|(_, c)| c.clone())
            .collect())
    }

    fn add_contact(&self, user: &str, contact: &str) -> ParleyResult<()> {
        let mut state = self.state();
        if !state.users.contains_key(user) || !state.users.contains_key(contact) {
            return Ok(());
        }
        state.contacts.insert((user.to_string(), contact.to_string()));
        Ok(())
    }

    fn remove_contact(&self, user: &str, contact: &str) -> ParleyResult<()> {
        self.state()
            .contacts
            .remove(&(user.to_string(), contact.to_string()));
        Ok(())
    }

    fn all_usernames(&self) -> ParleyResult<Vec<String>> {
        Ok(self.state().users.keys().cloned().collect())
    }

    fn public_key_of(&self, name: &str) -> ParleyResult<Option<String>> {
        Ok(self.state().users.get(name).and_then(|u| u.public_key.clone()))
    }

    fn record_message_sent(&self, sender: &str, recipient: &str) -> ParleyResult<()> {
        let mut state = self.state();
        if let Some(u) = state.users.get_mut(sender) {
            u.sent += 1;
        }
        if let Some(u) = state.users.get_mut(recipient) {
            u.accepted += 1;
        }
        Ok(())
    }
}
