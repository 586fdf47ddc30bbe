//! Wire protocol shared by the server, the daemon and the one-shot client.
//!
//! Every frame is a JSON envelope `{ "type", "timestamp", "data" }`. The
//! `type` string selects one variant of the closed [`Message`] union and
//! `data` carries that variant's payload. Decoding is two-step: the envelope
//! first (so the timestamp is available for authentication), then the
//! payload, so a malformed body can be reported per message kind without
//! tearing down the connection.

pub mod messages;

pub use messages::{
    AuthRequest, AuthResponse, CertAck, CertPush, CertRequest, CertResponse, ClientStatusInfo,
    DomainStatus, ErrorData, StatusResponse, SubscribeRequest, SyncRequest, ERROR_AUTH_REQUIRED,
    ERROR_BAD_REQUEST,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bundle::unix_now;

/// Protocol decoding/encoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not a valid envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Envelope `type` is not a known message kind
    #[error("unknown message type: {0}")]
    UnknownKind(String),

    /// Envelope is valid but its payload does not match the message kind
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Payload could not be serialized
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw wire envelope.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    /// Parse a text frame into an envelope without interpreting the payload.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Encode {
            kind: "envelope",
            source,
        })
    }

    /// Interpret the payload according to the envelope type.
    pub fn message(&self) -> Result<Message, ProtocolError> {
        Message::from_envelope(self)
    }

    fn payload<T: DeserializeOwned + Default>(&self, kind: &'static str) -> Result<T, ProtocolError> {
        match &self.data {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => T::deserialize(value)
                .map_err(|source| ProtocolError::InvalidPayload { kind, source }),
        }
    }

    fn required<T: DeserializeOwned>(&self, kind: &'static str) -> Result<T, ProtocolError> {
        let value = self.data.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
    }
}

/// Every message kind exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth(AuthRequest),
    AuthResult(AuthResponse),
    Subscribe(SubscribeRequest),
    CertPush(CertPush),
    CertAck(CertAck),
    CertRequest(CertRequest),
    CertResponse(CertResponse),
    StatusRequest,
    StatusResponse(StatusResponse),
    SyncRequest(SyncRequest),
    Ping,
    Pong,
    Error(ErrorData),
}

impl Message {
    pub const AUTH: &'static str = "auth";
    pub const AUTH_RESULT: &'static str = "auth_result";
    pub const SUBSCRIBE: &'static str = "subscribe";
    pub const CERT_PUSH: &'static str = "cert_push";
    pub const CERT_ACK: &'static str = "cert_ack";
    pub const CERT_REQUEST: &'static str = "cert_request";
    pub const CERT_RESPONSE: &'static str = "cert_response";
    pub const STATUS_REQUEST: &'static str = "status_request";
    pub const STATUS_RESPONSE: &'static str = "status_response";
    pub const SYNC_REQUEST: &'static str = "sync_request";
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";
    pub const ERROR: &'static str = "error";

    /// Wire `type` string of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth(_) => Self::AUTH,
            Message::AuthResult(_) => Self::AUTH_RESULT,
            Message::Subscribe(_) => Self::SUBSCRIBE,
            Message::CertPush(_) => Self::CERT_PUSH,
            Message::CertAck(_) => Self::CERT_ACK,
            Message::CertRequest(_) => Self::CERT_REQUEST,
            Message::CertResponse(_) => Self::CERT_RESPONSE,
            Message::StatusRequest => Self::STATUS_REQUEST,
            Message::StatusResponse(_) => Self::STATUS_RESPONSE,
            Message::SyncRequest(_) => Self::SYNC_REQUEST,
            Message::Ping => Self::PING,
            Message::Pong => Self::PONG,
            Message::Error(_) => Self::ERROR,
        }
    }

    fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let message = match envelope.kind.as_str() {
            Self::AUTH => Message::Auth(envelope.required(Self::AUTH)?),
            Self::AUTH_RESULT => Message::AuthResult(envelope.required(Self::AUTH_RESULT)?),
            Self::SUBSCRIBE => Message::Subscribe(envelope.payload(Self::SUBSCRIBE)?),
            Self::CERT_PUSH => Message::CertPush(envelope.required(Self::CERT_PUSH)?),
            Self::CERT_ACK => Message::CertAck(envelope.required(Self::CERT_ACK)?),
            Self::CERT_REQUEST => Message::CertRequest(envelope.payload(Self::CERT_REQUEST)?),
            Self::CERT_RESPONSE => Message::CertResponse(envelope.required(Self::CERT_RESPONSE)?),
            Self::STATUS_REQUEST => Message::StatusRequest,
            Self::STATUS_RESPONSE => {
                Message::StatusResponse(envelope.required(Self::STATUS_RESPONSE)?)
            }
            Self::SYNC_REQUEST => Message::SyncRequest(envelope.payload(Self::SYNC_REQUEST)?),
            Self::PING => Message::Ping,
            Self::PONG => Message::Pong,
            Self::ERROR => Message::Error(envelope.required(Self::ERROR)?),
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };
        Ok(message)
    }

    fn payload_value(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        let value = match self {
            Message::Auth(req) => serde_json::to_value(req)?,
            Message::AuthResult(resp) => serde_json::to_value(resp)?,
            Message::Subscribe(req) => serde_json::to_value(req)?,
            Message::CertPush(push) => serde_json::to_value(push)?,
            Message::CertAck(ack) => serde_json::to_value(ack)?,
            Message::CertRequest(req) => serde_json::to_value(req)?,
            Message::CertResponse(resp) => serde_json::to_value(resp)?,
            Message::StatusResponse(resp) => serde_json::to_value(resp)?,
            Message::SyncRequest(req) => serde_json::to_value(req)?,
            Message::Error(err) => serde_json::to_value(err)?,
            Message::StatusRequest | Message::Ping | Message::Pong => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Wrap into an envelope stamped with the given Unix timestamp.
    pub fn into_envelope_at(self, timestamp: i64) -> Result<Envelope, ProtocolError> {
        let kind = self.kind();
        let data = self
            .payload_value()
            .map_err(|source| ProtocolError::Encode { kind, source })?;

        Ok(Envelope {
            kind: kind.to_string(),
            timestamp,
            data,
        })
    }

    /// Wrap into an envelope stamped with the current time.
    pub fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        self.into_envelope_at(unix_now())
    }

    /// Encode straight to a text frame.
    pub fn encode(self) -> Result<String, ProtocolError> {
        self.into_envelope()?.encode()
    }
}

/// Serde adapter encoding file contents as standard base64 strings.
pub mod files_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    use crate::bundle::FileMap;

    pub fn serialize<S>(files: &FileMap, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(
            files
                .iter()
                .map(|(name, content)| (name, STANDARD.encode(content))),
        )
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<FileMap, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<BTreeMap<String, String>> = Option::deserialize(deserializer)?;
        encoded
            .unwrap_or_default()
            .into_iter()
            .map(|(name, content)| {
                STANDARD
                    .decode(content.as_bytes())
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|e| D::Error::custom(format!("file {name}: {e}")))
            })
            .collect()
    }
}
