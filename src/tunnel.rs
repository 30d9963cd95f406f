//! Wire format for messages exchanged between relay and client
//!
//! Every frame is a JSON envelope `{"type": ..., "payload": ...}`. The
//! payload shape is determined by `type`, so decoding always reads the
//! tag first and only then interprets the payload.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TunnelError};

/// Default path of the relay's tunnel endpoint
pub const DEFAULT_TUNNEL_PATH: &str = "/tunnel";

/// Header map carried on the wire; multi-valued headers keep their first value
pub type Headers = HashMap<String, String>;

/// Collapse an HTTP header map to one value per name, keeping the first
///
/// Wire headers are JSON strings, so bytes that are not UTF-8 are replaced.
#[must_use]
pub fn collapse_headers(headers: &HeaderMap) -> Headers {
    headers
        .keys()
        .filter_map(|name| {
            headers.get(name).map(|value| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
        })
        .collect()
}

/// Discriminant of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client asks for a tunnel
    Register,
    /// Relay confirms the tunnel and its public URL
    Registered,
    /// Relay forwards a public HTTP request
    Request,
    /// Client returns the local HTTP response
    Response,
    /// Protocol-level failure
    Error,
}

impl MessageType {
    /// Wire name of the message type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Registered => "registered",
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
        }
    }
}

impl MessageType {
    /// Look up a wire name; `None` for types this version does not know
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "register" => Some(Self::Register),
            "registered" => Some(Self::Registered),
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent by the client to request a tunnel. Reserved for an auth token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {}

/// Sent by the relay once the tunnel is live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPayload {
    /// Full public URL, e.g. `http://localhost:8080/ab12cd34`
    pub url: String,
    /// Routing key the relay stored the tunnel under
    pub subdomain: String,
}

/// An HTTP request forwarded from the relay to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Correlation id, unique among the tunnel's in-flight requests
    pub id: String,
    pub method: String,
    /// Path below the subdomain prefix, always starting with `/`
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

/// The local HTTP response returned by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Id of the request this answers
    pub id: String,
    pub status_code: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

impl ResponsePayload {
    /// Build a plain-text response for a failure produced by the tunnel itself
    #[must_use]
    pub fn text(id: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self {
            id: id.into(),
            status_code,
            headers,
            body: Bytes::from(message.into()),
        }
    }
}

/// Protocol-level failure description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Messages exchanged between client and relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register(RegisterPayload),
    Registered(RegisteredPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: MessageType,
    payload: &'a P,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Message {
    /// Type tag of this message
    #[must_use]
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Register(_) => MessageType::Register,
            Self::Registered(_) => MessageType::Registered,
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Encode the message as a JSON envelope
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        let kind = self.kind();
        let encoded = match self {
            Self::Register(p) => serde_json::to_string(&OutgoingEnvelope { kind, payload: p }),
            Self::Registered(p) => serde_json::to_string(&OutgoingEnvelope { kind, payload: p }),
            Self::Request(p) => serde_json::to_string(&OutgoingEnvelope { kind, payload: p }),
            Self::Response(p) => serde_json::to_string(&OutgoingEnvelope { kind, payload: p }),
            Self::Error(p) => serde_json::to_string(&OutgoingEnvelope { kind, payload: p }),
        };
        encoded.map_err(|e| TunnelError::protocol(format!("failed to encode {kind}: {e}")))
    }

    /// Decode a JSON envelope
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the frame is not a JSON envelope with a
    /// string `type`. Returns an unsupported error for an unknown `type`, a
    /// payload that does not match its `type`, or a response status outside
    /// `1..=999`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: IncomingEnvelope = serde_json::from_slice(data)
            .map_err(|e| TunnelError::protocol(format!("invalid envelope: {e}")))?;

        let kind = MessageType::from_wire(&envelope.kind).ok_or_else(|| {
            TunnelError::unsupported(format!("unknown message type {:?}", envelope.kind))
        })?;
        let message = match kind {
            MessageType::Register => {
                if envelope.payload.is_null() {
                    Self::Register(RegisterPayload::default())
                } else {
                    Self::Register(payload(kind, envelope.payload)?)
                }
            }
            MessageType::Registered => Self::Registered(payload(kind, envelope.payload)?),
            MessageType::Request => Self::Request(payload(kind, envelope.payload)?),
            MessageType::Response => {
                let response: ResponsePayload = payload(kind, envelope.payload)?;
                if !(1..=999).contains(&response.status_code) {
                    return Err(TunnelError::unsupported(format!(
                        "response {} has invalid status code {}",
                        response.id, response.status_code
                    )));
                }
                Self::Response(response)
            }
            MessageType::Error => Self::Error(payload(kind, envelope.payload)?),
        };

        Ok(message)
    }
}

fn payload<T: DeserializeOwned>(kind: MessageType, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| TunnelError::unsupported(format!("invalid {kind} payload: {e}")))
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Bodies travel as standard base64 strings; `null` means empty
mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
            None => Ok(Bytes::new()),
        }
    }
}
