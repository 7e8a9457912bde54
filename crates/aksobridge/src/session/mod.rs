//! Upstream session capability.
//!
//! Each connection owns exactly one [`SessionClient`], created by a
//! [`SessionFactory`] during the handshake and bound to that connection's
//! cookie jar. The connection engine only ever talks to the trait; the
//! reqwest-backed implementation lives in [`http`].

mod cookies;
pub mod http;
mod perms;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use cookies::CookieRecorder;
pub use http::{HttpSessionClient, HttpSessionFactory, InvalidHost};
pub use perms::Permissions;

/// The authenticated identity behind a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Public codeholder id.
    pub id: u64,
    /// Human-facing codeholder code.
    pub uea: String,
    /// A second factor is still required before the session is fully usable.
    pub totp_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl ApiMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A generic request forwarded verbatim to the upstream API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    pub query: serde_json::Map<String, serde_json::Value>,
    pub body: Option<serde_json::Value>,
    pub files: Vec<UploadFile>,
}

/// Response body, typed by what the upstream sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// Normalized upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub ok: bool,
    pub status: u16,
    /// Header names are lower-cased; repeated headers are joined with ", ".
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

/// A `field.flags` pair from a codeholder field query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAccess {
    pub field: String,
    pub flags: String,
}

impl FieldAccess {
    pub fn new(field: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            flags: flags.into(),
        }
    }

    /// Split on the first literal dot; a missing dot means no flags.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((field, flags)) => Self::new(field, flags),
            None => Self::new(s, ""),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream answered with a non-success status.
    #[error("upstream responded with status {}", .response.status)]
    Status { response: ApiResponse },

    /// No response was received.
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected upstream response: {0}")]
    Unexpected(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { response } => Some(response.status),
            _ => None,
        }
    }

    /// Status error without headers or body.
    pub fn from_status(status: u16) -> Self {
        Self::Status {
            response: ApiResponse {
                ok: false,
                status,
                headers: BTreeMap::new(),
                body: Body::Empty,
            },
        }
    }
}

/// Operations a connection can perform against the upstream API.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Resume whatever session the cookie jar holds.
    async fn restore_session(&self) -> Result<Option<Identity>, UpstreamError>;

    async fn log_in(&self, login: &str, password: &str) -> Result<Identity, UpstreamError>;

    async fn log_out(&self) -> Result<(), UpstreamError>;

    /// Verify a second-factor code, or enroll one when `secret` is given.
    async fn totp(
        &self,
        code: &str,
        secret: Option<&[u8]>,
        remember: bool,
    ) -> Result<(), UpstreamError>;

    async fn totp_remove(&self) -> Result<(), UpstreamError>;

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, UpstreamError>;

    async fn has_perms(&self, perms: &[String]) -> Result<Vec<bool>, UpstreamError>;

    async fn has_codeholder_fields(
        &self,
        fields: &[FieldAccess],
    ) -> Result<Vec<bool>, UpstreamError>;

    async fn has_own_codeholder_fields(
        &self,
        fields: &[FieldAccess],
    ) -> Result<Vec<bool>, UpstreamError>;
}

/// Builds one [`SessionClient`] per connection.
pub trait SessionFactory: Send + Sync {
    /// Base URL cookies from the handshake are scoped to.
    fn base_url(&self) -> &reqwest::Url;

    fn open(
        &self,
        cookies: Arc<CookieRecorder>,
        client_ip: &str,
    ) -> Result<Arc<dyn SessionClient>, UpstreamError>;
}
