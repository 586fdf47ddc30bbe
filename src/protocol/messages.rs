use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, FileMap};

use super::files_base64;

/// Error code sent when a privileged message arrives before authentication.
pub const ERROR_AUTH_REQUIRED: i32 = 401;
/// Error code sent for requests the server cannot interpret.
pub const ERROR_BAD_REQUEST: i32 = 400;

/// Authentication request from a client
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub client_id: String,
    /// hex(sha256(secret + timestamp))
    pub signature: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Authentication result sent back to the client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Replacement subscription list
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Certificate bundle pushed to a subscriber
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CertPush {
    pub domain: String,
    #[serde(default, with = "files_base64")]
    pub files: FileMap,
    #[serde(default)]
    pub timestamp: i64,
}

impl From<Bundle> for CertPush {
    fn from(bundle: Bundle) -> Self {
        Self {
            domain: bundle.domain,
            files: bundle.files,
            timestamp: bundle.timestamp,
        }
    }
}

/// Acknowledgement of a pushed bundle
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CertAck {
    pub domain: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// One-shot certificate download request
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CertRequest {
    #[serde(default)]
    pub domain: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

/// Response to a [`CertRequest`]; `error` is set instead of failing the
/// transport when the bundle cannot be served.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CertResponse {
    pub domain: String,
    #[serde(
        default,
        with = "files_base64",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub files: FileMap,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl CertResponse {
    pub fn failure(domain: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// One live connection as reported in a status response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientStatusInfo {
    pub id: String,
    pub remote_ip: String,
    pub connected_at: i64,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Certificate state of one domain directory on the server
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub last_update: i64,
    pub has_cert: bool,
    pub has_key: bool,
    pub has_fullchain: bool,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub cert_size: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub key_size: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub fullchain_size: u64,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Server status snapshot
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StatusResponse {
    pub generated_at: i64,
    #[serde(default)]
    pub clients: Vec<ClientStatusInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<DomainStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Catch-up request: domain -> newest timestamp the client holds (0 = none)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub timestamps: BTreeMap<String, i64>,
}

/// Typed error payload
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorData {
    pub code: i32,
    pub message: String,
}

impl ErrorData {
    pub fn auth_required() -> Self {
        Self {
            code: ERROR_AUTH_REQUIRED,
            message: "authentication required".to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: ERROR_BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}
