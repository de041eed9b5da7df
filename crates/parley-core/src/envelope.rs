//! Protocol envelopes: string-keyed JSON objects with an `action` or
//! `response` discriminant.
//!
//! Envelopes stay untyped maps on the wire so that relayed messages reach
//! the recipient exactly as the sender wrote them. The dispatcher parses
//! them into typed requests at the point of use.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Canonical field names.
pub mod fields {
    pub const ACTION: &str = "action";
    pub const TIME: &str = "time";
    pub const USER: &str = "user";
    pub const ACCOUNT_NAME: &str = "account_name";
    pub const PUBLIC_KEY: &str = "public_key";
    pub const SENDER: &str = "sender";
    pub const DESTINATION: &str = "destination";
    pub const MESSAGE_TEXT: &str = "message_text";
    pub const RESPONSE: &str = "response";
    pub const ERROR: &str = "error";
    pub const DATA: &str = "data";
    pub const LIST_INFO: &str = "list_info";
}

use fields::*;

/// Request kinds a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Presence,
    #[serde(alias = "message")]
    Msg,
    Exit,
    GetContacts,
    AddContact,
    RemoveContact,
    UsersRequest,
    PublicKeyRequest,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Presence => "presence",
            Action::Msg => "msg",
            Action::Exit => "exit",
            Action::GetContacts => "get_contacts",
            Action::AddContact => "add_contact",
            Action::RemoveContact => "remove_contact",
            Action::UsersRequest => "users_request",
            Action::PublicKeyRequest => "public_key_request",
        }
    }
}

/// Numeric codes carried in the `response` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseCode {
    Ok = 200,
    Accepted = 202,
    ContactsChanged = 205,
    BadRequest = 400,
    AuthRequired = 511,
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = String;
    fn try_from(v: u16) -> Result<Self, String> {
        match v {
            200 => Ok(Self::Ok),
            202 => Ok(Self::Accepted),
            205 => Ok(Self::ContactsChanged),
            400 => Ok(Self::BadRequest),
            511 => Ok(Self::AuthRequired),
            other => Err(format!("unknown response code: {other}")),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// An empty envelope.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// A request for `action`, stamped with the current time.
    pub fn request(action: Action) -> Self {
        Self::new()
            .with(ACTION, action.as_str())
            .with(TIME, unix_time())
    }

    /// A bare response carrying only `code`.
    pub fn response(code: ResponseCode) -> Self {
        Self::new().with(RESPONSE, u16::from(code))
    }

    /// A 400 response with a human-readable reason.
    pub fn bad_request(reason: &str) -> Self {
        Self::response(ResponseCode::BadRequest).with(ERROR, reason)
    }

    /// Builder: set `key` to `value`.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Builder: set the `data` field.
    pub fn with_data(self, data: impl Into<String>) -> Self {
        self.with(DATA, data.into())
    }

    /// Builder: set the `list_info` field.
    pub fn with_list(self, items: Vec<String>) -> Self {
        self.with(LIST_INFO, items)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value of `key`, if present and a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Raw `action` text, whether or not it names a known action.
    pub fn action_name(&self) -> Option<&str> {
        self.str_field(ACTION)
    }

    /// Parsed `action`; `None` when absent or unrecognised.
    pub fn action(&self) -> Option<Action> {
        let name = self.action_name()?;
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    /// The `response` code, if this is a response envelope.
    pub fn response_code(&self) -> Option<u16> {
        self.0
            .get(RESPONSE)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn is_response(&self, code: ResponseCode) -> bool {
        self.response_code() == Some(u16::from(code))
    }

    pub fn error_text(&self) -> Option<&str> {
        self.str_field(ERROR)
    }

    pub fn data(&self) -> Option<&str> {
        self.str_field(DATA)
    }

    /// The `list_info` array as strings (non-string items are skipped).
    pub fn list(&self) -> Option<Vec<String>> {
        let items = self.0.get(LIST_INFO)?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Nested `user` object of a presence envelope: `(account_name, public_key)`.
    pub fn user_block(&self) -> Option<(&str, Option<&str>)> {
        let user = self.0.get(USER)?.as_object()?;
        let name = user.get(ACCOUNT_NAME)?.as_str()?;
        let key = user.get(PUBLIC_KEY).and_then(Value::as_str);
        Some((name, key))
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Seconds since the epoch, fractional, as clients have always sent it.
fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
