//! Challenge-response login.
//!
//! `presence` starts the exchange: the server checks the name is free and
//! registered, then answers `511` with a random challenge. The client's next
//! envelope must be a `511` carrying the base64 HMAC of that challenge keyed
//! with its password secret. The challenge lives on the connection until it
//! is answered or its deadline passes, so a slow client never holds up the
//! loop.

use crate::connection::{ConnId, LoginState};
use crate::directory::UserDirectory;
use crate::relay::{Relay, SessionRegistry};
use parley_core::envelope::fields::TIME;
use parley_core::{
    generate_challenge, verify_digest, Envelope, ParleyError, ParleyResult, ResponseCode,
};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A challenge issued to a connection and not yet answered.
pub struct PendingChallenge {
    pub username: String,
    pub public_key: String,
    pub challenge: String,
    secret: Vec<u8>,
    deadline: Instant,
}

impl PendingChallenge {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// The `511` envelope that carries this challenge to the client.
    pub fn envelope(&self) -> Envelope {
        Envelope::response(ResponseCode::AuthRequired).with_data(self.challenge.as_str())
    }
}

impl fmt::Debug for PendingChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingChallenge")
            .field("username", &self.username)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Validate a login request and issue a challenge for it.
pub fn begin(
    registry: &SessionRegistry,
    directory: &dyn UserDirectory,
    username: &str,
    public_key: &str,
    timeout: Duration,
) -> ParleyResult<PendingChallenge> {
    if registry.lookup(username).is_some() {
        return Err(ParleyError::DuplicateSession(username.to_string()));
    }
    if !directory.user_exists(username)? {
        return Err(ParleyError::UnknownUser(username.to_string()));
    }
    let secret = directory.password_secret(username)?;

    Ok(PendingChallenge {
        username: username.to_string(),
        public_key: public_key.to_string(),
        challenge: generate_challenge(),
        secret,
        deadline: Instant::now() + timeout,
    })
}

/// Check the client's answer to `pending`.
pub fn verify(pending: &PendingChallenge, reply: &Envelope) -> ParleyResult<()> {
    if !reply.is_response(ResponseCode::AuthRequired) {
        return Err(ParleyError::AuthFailed("expected a 511 challenge answer".into()));
    }
    let digest = reply
        .data()
        .ok_or_else(|| ParleyError::AuthFailed("challenge answer has no digest".into()))?;
    if !verify_digest(&pending.secret, &pending.challenge, digest) {
        return Err(ParleyError::AuthFailed(pending.username.clone()));
    }
    Ok(())
}

impl Relay {
    /// Handle a `presence` envelope from `id`.
    pub(crate) async fn handle_presence(&mut self, id: ConnId, envelope: &Envelope) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if matches!(conn.state(), LoginState::Authenticated) {
            warn!(conn = id, "presence on an authenticated connection");
            self.reply(id, Envelope::bad_request("malformed request")).await;
            return;
        }
        let ip = conn.peer().ip();

        let block = envelope.user_block();
        let (Some((username, Some(public_key))), Some(_)) = (block, envelope.get(TIME)) else {
            debug!(conn = id, "presence without user block");
            self.reply(id, Envelope::bad_request("malformed request")).await;
            return;
        };

        if !self.throttle.check_and_record(ip) {
            warn!(conn = id, %ip, username, "login attempts throttled");
            self.reply(id, Envelope::bad_request("too many login attempts")).await;
            self.close_connection(id, "login throttled");
            return;
        }

        let pending = match begin(
            &self.registry,
            self.directory.as_ref(),
            username,
            public_key,
            self.io_timeout,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.reject(id, e).await;
                return;
            }
        };

        debug!(conn = id, username, "challenge issued");
        let challenge = pending.envelope();
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_state(LoginState::ChallengeSent(pending));
        }
        self.reply(id, challenge).await;
    }

    /// Handle the envelope that answers the challenge outstanding on `id`.
    pub(crate) async fn handle_challenge_reply(
        &mut self,
        id: ConnId,
        pending: PendingChallenge,
        envelope: &Envelope,
    ) {
        if let Err(e) = verify(&pending, envelope) {
            self.reject(id, e).await;
            return;
        }
        if let Err(e) = self.registry.bind(&pending.username, id) {
            self.reject(id, e).await;
            return;
        }

        let Some(conn) = self.connections.get_mut(&id) else {
            self.registry.unbind_connection(id);
            return;
        };
        conn.set_state(LoginState::Authenticated);
        let peer = conn.peer();

        if let Err(e) = self.directory.record_login(
            &pending.username,
            peer.ip(),
            peer.port(),
            &pending.public_key,
        ) {
            self.reject(id, ParleyError::Directory(e.to_string())).await;
            return;
        }

        info!(conn = id, username = %pending.username, "logged in");
        self.reply(id, Envelope::response(ResponseCode::Ok)).await;
    }

    /// Answer a failed login with 400 and drop the connection.
    async fn reject(&mut self, id: ConnId, err: ParleyError) {
        warn!(conn = id, error = %err, "login rejected");
        self.reply(id, Envelope::bad_request(err.wire_reason())).await;
        self.close_connection(id, "login rejected");
    }
}
