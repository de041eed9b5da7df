//! Per-envelope protocol state machine.
//!
//! Every decoded envelope passes through [`Relay::dispatch`]: an outstanding
//! challenge consumes it first, `presence` goes to the handshake, and every
//! other action needs a bound session whose name matches the principal the
//! envelope declares.

use crate::auth::{check_principal, require_session};
use crate::connection::ConnId;
use crate::relay::{Delivery, Relay};
use parley_core::envelope::fields::{ACCOUNT_NAME, DESTINATION, MESSAGE_TEXT, SENDER, TIME, USER};
use parley_core::{Action, Envelope, ParleyError, ParleyResult, ResponseCode};
use tracing::{debug, info, warn};

/// A structurally complete request for an action other than `presence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Message { sender: String, destination: String },
    Exit { account: String },
    GetContacts { user: String },
    AddContact { user: String, contact: String },
    RemoveContact { user: String, contact: String },
    UsersRequest { account: String },
    PublicKeyRequest { account: String },
}

impl Request {
    /// Parse `envelope` into a request. Unknown actions and missing fields
    /// are malformed.
    pub fn parse(envelope: &Envelope) -> ParleyResult<Self> {
        let field = |key: &str| {
            envelope
                .str_field(key)
                .map(str::to_string)
                .ok_or_else(|| ParleyError::MalformedMessage(format!("missing `{key}`")))
        };

        let action = envelope.action().ok_or_else(|| {
            ParleyError::MalformedMessage(format!(
                "unknown action {:?}",
                envelope.action_name().unwrap_or_default()
            ))
        })?;

        Ok(match action {
            Action::Presence => {
                return Err(ParleyError::MalformedMessage(
                    "presence is handled by the handshake".into(),
                ))
            }
            Action::Msg => {
                if envelope.get(TIME).is_none() {
                    return Err(ParleyError::MalformedMessage("missing `time`".into()));
                }
                field(MESSAGE_TEXT)?;
                Request::Message {
                    sender: field(SENDER)?,
                    destination: field(DESTINATION)?,
                }
            }
            Action::Exit => Request::Exit { account: field(ACCOUNT_NAME)? },
            Action::GetContacts => Request::GetContacts { user: field(USER)? },
            Action::AddContact => Request::AddContact {
                user: field(USER)?,
                contact: field(ACCOUNT_NAME)?,
            },
            Action::RemoveContact => Request::RemoveContact {
                user: field(USER)?,
                contact: field(ACCOUNT_NAME)?,
            },
            Action::UsersRequest => Request::UsersRequest { account: field(ACCOUNT_NAME)? },
            Action::PublicKeyRequest => Request::PublicKeyRequest { account: field(ACCOUNT_NAME)? },
        })
    }

    /// The name this request claims to act as. `None` means no binding check.
    pub fn principal(&self) -> Option<&str> {
        match self {
            Request::Message { sender, .. } => Some(sender),
            Request::Exit { account } | Request::UsersRequest { account } => Some(account),
            Request::GetContacts { user }
            | Request::AddContact { user, .. }
            | Request::RemoveContact { user, .. } => Some(user),
            Request::PublicKeyRequest { .. } => None,
        }
    }
}

impl Relay {
    /// Process one envelope received on `id`.
    pub async fn dispatch(&mut self, id: ConnId, envelope: Envelope) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Some(pending) = conn.take_challenge() {
            self.handle_challenge_reply(id, pending, &envelope).await;
            return;
        }

        if envelope.action() == Some(Action::Presence) {
            self.handle_presence(id, &envelope).await;
            return;
        }

        let session = match require_session(self.registry.username_of(id)) {
            Ok(name) => name.to_string(),
            Err(e) => {
                warn!(conn = id, action = ?envelope.action_name(), error = %e, "rejected");
                self.close_connection(id, "action before login");
                return;
            }
        };

        let request = match Request::parse(&envelope) {
            Ok(r) => r,
            Err(e) => {
                debug!(conn = id, username = %session, error = %e, "bad request");
                self.reply(id, Envelope::bad_request(e.wire_reason())).await;
                return;
            }
        };

        if let Err(e) = check_principal(&session, request.principal()) {
            warn!(conn = id, username = %session, error = %e, "principal mismatch");
            self.close_connection(id, "principal mismatch");
            return;
        }

        let reply = match self.handle(id, &session, request, &envelope).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                warn!(conn = id, username = %session, error = %e, "request failed");
                Envelope::bad_request(e.wire_reason())
            }
        };
        self.reply(id, reply).await;
    }

    /// Run `request` for `session`; `Ok(None)` means no reply is due.
    async fn handle(
        &mut self,
        id: ConnId,
        session: &str,
        request: Request,
        envelope: &Envelope,
    ) -> ParleyResult<Option<Envelope>> {
        let reply = match request {
            Request::Message { destination, .. } => {
                if self.registry.lookup(&destination).is_none() {
                    return Err(ParleyError::UnknownDestination(destination));
                }
                self.directory
                    .record_message_sent(session, &destination)
                    .map_err(directory_err)?;
                if self.route(envelope) == Delivery::PeerLost {
                    debug!(
                        username = session,
                        destination = %destination,
                        "recipient dropped during relay"
                    );
                }
                Envelope::response(ResponseCode::Ok)
            }
            Request::Exit { .. } => {
                info!(conn = id, username = session, "client exit");
                self.close_connection(id, "client exit");
                return Ok(None);
            }
            Request::GetContacts { user } => {
                let contacts = self.directory.contacts_of(&user).map_err(directory_err)?;
                Envelope::response(ResponseCode::Accepted).with_list(contacts)
            }
            Request::AddContact { user, contact } => {
                self.directory
                    .add_contact(&user, &contact)
                    .map_err(directory_err)?;
                debug!(username = %user, contact = %contact, "contact added");
                Envelope::response(ResponseCode::Ok)
            }
            Request::RemoveContact { user, contact } => {
                self.directory
                    .remove_contact(&user, &contact)
                    .map_err(directory_err)?;
                debug!(username = %user, contact = %contact, "contact removed");
                Envelope::response(ResponseCode::Ok)
            }
            Request::UsersRequest { .. } => {
                let users = self.directory.all_usernames().map_err(directory_err)?;
                Envelope::response(ResponseCode::Accepted).with_list(users)
            }
            Request::PublicKeyRequest { account } => {
                match self.directory.public_key_of(&account).map_err(directory_err)? {
                    Some(key) if !key.is_empty() => {
                        Envelope::response(ResponseCode::AuthRequired).with_data(key)
                    }
                    _ => Envelope::bad_request("public key not found"),
                }
            }
        };
        Ok(Some(reply))
    }
}

/// Any directory failure surfaces to the client as "directory unavailable".
fn directory_err(e: ParleyError) -> ParleyError {
    match e {
        ParleyError::Directory(_) => e,
        other => ParleyError::Directory(other.to_string()),
    }
}
