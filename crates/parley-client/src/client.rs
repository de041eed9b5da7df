//! The parley client.
//!
//! One TCP connection, driven by the caller. Replies are read in order;
//! anything the server pushes meanwhile (relayed messages, contact-list
//! updates) is queued and handed out by [`ParleyClient::next_incoming`].

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time;
use tracing::debug;

use parley_core::envelope::fields::{
    ACCOUNT_NAME, DESTINATION, MESSAGE_TEXT, PUBLIC_KEY, SENDER, USER,
};
use parley_core::{
    compute_digest, derive_password_secret, encode_digest, frame_encode, Action, Envelope,
    FrameDecoder, ParleyError, ParleyResult, ResponseCode,
};

pub struct ParleyClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    /// Decoded envelopes not yet handed out.
    inbox: VecDeque<Envelope>,
    /// Server pushes that arrived while a reply was awaited.
    incoming: VecDeque<Envelope>,
    timeout: Duration,
    username: Option<String>,
}

impl ParleyClient {
    /// Open a connection. `timeout` bounds the connect and every later read or write.
    pub async fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> ParleyResult<Self> {
        let stream = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ParleyError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            inbox: VecDeque::new(),
            incoming: VecDeque::new(),
            timeout,
            username: None,
        })
    }

    /// The name this client logged in as.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Log in: presence, answer the 511 challenge, expect 200.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
        public_key: &str,
    ) -> ParleyResult<()> {
        let presence = Envelope::request(Action::Presence).with(
            USER,
            json!({ ACCOUNT_NAME: username, PUBLIC_KEY: public_key }),
        );
        let reply = self.request(&presence).await?;
        if !reply.is_response(ResponseCode::AuthRequired) {
            return Err(reply_error(&reply));
        }
        let challenge = reply
            .data()
            .ok_or_else(|| ParleyError::MalformedMessage("challenge without data".into()))?;

        let secret = derive_password_secret(username, password);
        let digest = compute_digest(secret.as_bytes(), challenge);
        let answer =
            Envelope::response(ResponseCode::AuthRequired).with_data(encode_digest(&digest));

        let reply = self.request(&answer).await?;
        expect(&reply, ResponseCode::Ok)?;
        debug!(username, "logged in");
        self.username = Some(username.to_string());
        Ok(())
    }

    /// Send a text message to `destination` through the relay.
    pub async fn send_message(&mut self, destination: &str, text: &str) -> ParleyResult<()> {
        let sender = self.session()?.to_string();
        let envelope = Envelope::request(Action::Msg)
            .with(SENDER, sender)
            .with(DESTINATION, destination)
            .with(MESSAGE_TEXT, text);
        let reply = self.request(&envelope).await?;
        if reply.is_response(ResponseCode::BadRequest)
            && reply.error_text() == Some("user not registered")
        {
            return Err(ParleyError::UnknownDestination(destination.to_string()));
        }
        expect(&reply, ResponseCode::Ok)
    }

    pub async fn contacts(&mut self) -> ParleyResult<Vec<String>> {
        let user = self.session()?.to_string();
        let reply = self
            .request(&Envelope::request(Action::GetContacts).with(USER, user))
            .await?;
        list_reply(&reply)
    }

    pub async fn add_contact(&mut self, contact: &str) -> ParleyResult<()> {
        self.contact_op(Action::AddContact, contact).await
    }

    pub async fn remove_contact(&mut self, contact: &str) -> ParleyResult<()> {
        self.contact_op(Action::RemoveContact, contact).await
    }

    async fn contact_op(&mut self, action: Action, contact: &str) -> ParleyResult<()> {
        let user = self.session()?.to_string();
        let envelope = Envelope::request(action)
            .with(USER, user)
            .with(ACCOUNT_NAME, contact);
        let reply = self.request(&envelope).await?;
        expect(&reply, ResponseCode::Ok)
    }

    /// Every username the server knows.
    pub async fn known_users(&mut self) -> ParleyResult<Vec<String>> {
        let account = self.session()?.to_string();
        let reply = self
            .request(&Envelope::request(Action::UsersRequest).with(ACCOUNT_NAME, account))
            .await?;
        list_reply(&reply)
    }

    /// `name`'s last-presented public key, or `None` if the server has none.
    pub async fn public_key_of(&mut self, name: &str) -> ParleyResult<Option<String>> {
        let reply = self
            .request(&Envelope::request(Action::PublicKeyRequest).with(ACCOUNT_NAME, name))
            .await?;
        if reply.is_response(ResponseCode::BadRequest) {
            return Ok(None);
        }
        expect(&reply, ResponseCode::AuthRequired)?;
        Ok(reply.data().map(str::to_string))
    }

    /// Announce exit and close the connection. The server does not reply.
    pub async fn exit(mut self) -> ParleyResult<()> {
        let account = self.session()?.to_string();
        self.send_envelope(&Envelope::request(Action::Exit).with(ACCOUNT_NAME, account))
            .await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Send `envelope` and return the next non-push envelope.
    pub async fn request(&mut self, envelope: &Envelope) -> ParleyResult<Envelope> {
        self.send_envelope(envelope).await?;
        loop {
            let next = self.next_envelope().await?;
            if is_push(&next) {
                self.incoming.push_back(next);
            } else {
                return Ok(next);
            }
        }
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) -> ParleyResult<()> {
        let frame = frame_encode(envelope)?;
        self.send_raw(&frame).await
    }

    /// Write bytes as-is, without framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> ParleyResult<()> {
        time::timeout(self.timeout, self.stream.write_all(bytes))
            .await
            .map_err(|_| ParleyError::Timeout)?
            .map_err(|e| ParleyError::PeerUnreachable(e.to_string()))
    }

    /// The next envelope off the wire, whatever it is.
    ///
    /// A closed connection is `PeerUnreachable`; nothing arriving within the
    /// timeout is `Timeout`.
    pub async fn next_envelope(&mut self) -> ParleyResult<Envelope> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(envelope) = self.inbox.pop_front() {
                return Ok(envelope);
            }
            let n = time::timeout(self.timeout, self.stream.read(&mut buf))
                .await
                .map_err(|_| ParleyError::Timeout)?
                .map_err(|e| ParleyError::PeerUnreachable(e.to_string()))?;
            if n == 0 {
                return Err(ParleyError::PeerUnreachable("connection closed by server".into()));
            }
            let decoded: Vec<Envelope> = self.decoder.feed(&buf[..n])?;
            self.inbox.extend(decoded);
        }
    }

    /// The next server push: a relayed message or a contact-list update.
    pub async fn next_incoming(&mut self) -> ParleyResult<Envelope> {
        if let Some(envelope) = self.incoming.pop_front() {
            return Ok(envelope);
        }
        loop {
            let next = self.next_envelope().await?;
            if is_push(&next) {
                return Ok(next);
            }
            debug!(envelope = ?next, "discarding unsolicited reply");
        }
    }

    /// Drain pushes already queued, without reading.
    pub fn take_incoming(&mut self) -> Vec<Envelope> {
        self.incoming.drain(..).collect()
    }

    fn session(&self) -> ParleyResult<&str> {
        self.username
            .as_deref()
            .ok_or_else(|| ParleyError::Unauthorized("not logged in".into()))
    }
}

impl std::fmt::Debug for ParleyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParleyClient")
            .field("peer", &self.stream.peer_addr().ok())
            .field("username", &self.username)
            .field("queued", &self.incoming.len())
            .finish()
    }
}

/// Envelopes the server sends unprompted.
fn is_push(envelope: &Envelope) -> bool {
    envelope.action_name().is_some() || envelope.is_response(ResponseCode::ContactsChanged)
}

fn expect(reply: &Envelope, code: ResponseCode) -> ParleyResult<()> {
    if reply.is_response(code) {
        Ok(())
    } else {
        Err(reply_error(reply))
    }
}

fn list_reply(reply: &Envelope) -> ParleyResult<Vec<String>> {
    expect(reply, ResponseCode::Accepted)?;
    reply
        .list()
        .ok_or_else(|| ParleyError::MalformedMessage("202 without list_info".into()))
}

/// Turn an unexpected reply into the error it stands for.
fn reply_error(reply: &Envelope) -> ParleyError {
    match reply.error_text() {
        Some("name already in use") => ParleyError::DuplicateSession("name already in use".into()),
        Some("user not registered") => ParleyError::UnknownUser("user not registered".into()),
        Some("wrong password") => ParleyError::AuthFailed("wrong password".into()),
        Some("directory unavailable") => ParleyError::Directory("directory unavailable".into()),
        Some(other) => ParleyError::MalformedMessage(other.to_string()),
        None => ParleyError::MalformedMessage(format!(
            "unexpected reply: {:?}",
            reply.response_code()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_are_actions_and_205() {
        assert!(is_push(&Envelope::request(Action::Msg)));
        assert!(is_push(&Envelope::response(ResponseCode::ContactsChanged)));
        assert!(!is_push(&Envelope::response(ResponseCode::Ok)));
        assert!(!is_push(&Envelope::bad_request("wrong password")));
    }

    #[test]
    fn bad_request_maps_to_error() {
        let err = reply_error(&Envelope::bad_request("name already in use"));
        assert!(matches!(err, ParleyError::DuplicateSession(_)));
        let err = reply_error(&Envelope::bad_request("wrong password"));
        assert!(matches!(err, ParleyError::AuthFailed(_)));
        let err = reply_error(&Envelope::bad_request("too many login attempts"));
        assert!(matches!(
            err,
            ParleyError::MalformedMessage(ref m) if m == "too many login attempts"
        ));
    }

    #[test]
    fn list_reply_needs_202() {
        let ok = Envelope::response(ResponseCode::Accepted).with_list(vec!["bob".into()]);
        assert_eq!(list_reply(&ok).unwrap(), vec!["bob".to_string()]);
        assert!(list_reply(&Envelope::response(ResponseCode::Ok)).is_err());
    }
}
