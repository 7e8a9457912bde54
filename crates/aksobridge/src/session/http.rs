//! reqwest-backed session client for the AKSO API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::json;

use super::{
    ApiMethod, ApiRequest, ApiResponse, Body, CookieRecorder, FieldAccess, Identity,
    Permissions, SessionClient, SessionFactory, UpstreamError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The configured upstream host is not a usable base URL.
#[derive(Debug, thiserror::Error)]
#[error("invalid upstream host {host:?}: {reason}")]
pub struct InvalidHost {
    pub host: String,
    pub reason: String,
}

/// Builds [`HttpSessionClient`]s against one upstream host.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    base: Url,
    user_agent: String,
}

impl HttpSessionFactory {
    pub fn new(host: &str, user_agent: impl Into<String>) -> Result<Self, InvalidHost> {
        let invalid = |reason: String| InvalidHost {
            host: host.to_string(),
            reason,
        };
        let base = Url::parse(host).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", base.scheme())));
        }
        Ok(Self {
            base,
            user_agent: user_agent.into(),
        })
    }
}

impl SessionFactory for HttpSessionFactory {
    fn base_url(&self) -> &Url {
        &self.base
    }

    fn open(
        &self,
        cookies: Arc<CookieRecorder>,
        client_ip: &str,
    ) -> Result<Arc<dyn SessionClient>, UpstreamError> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        match HeaderValue::from_str(client_ip) {
            Ok(value) => {
                headers.insert("x-forwarded-for", value);
            }
            Err(_) => tracing::warn!(client_ip, "Client ip is not a valid header value"),
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_provider(cookies)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Arc::new(HttpSessionClient {
            client,
            base: self.base.clone(),
        }))
    }
}

/// One authenticated upstream session.
pub struct HttpSessionClient {
    client: reqwest::Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthInfo {
    id: u64,
    #[serde(alias = "uea")]
    new_code: String,
    #[serde(default)]
    totp_set_up: bool,
    #[serde(default)]
    totp_used: bool,
}

impl From<AuthInfo> for Identity {
    fn from(info: AuthInfo) -> Self {
        Self {
            id: info.id,
            uea: info.new_code,
            totp_pending: info.totp_set_up && !info.totp_used,
        }
    }
}

impl HttpSessionClient {
    fn url(&self, path: &str) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<ApiResponse, UpstreamError> {
        let response = builder.send().await?;
        let status = response.status();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes());
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.into_owned());
        }

        let is_json = headers
            .get(CONTENT_TYPE.as_str())
            .is_some_and(|ct| is_json_content_type(ct));
        let bytes = response.bytes().await?;

        tracing::debug!(status = status.as_u16(), len = bytes.len(), "Upstream response");

        Ok(ApiResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            headers,
            body: parse_body(&bytes, is_json),
        })
    }

    /// Like [`send`](Self::send), but a non-success status is an error.
    async fn send_checked(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<ApiResponse, UpstreamError> {
        let response = self.send(builder).await?;
        if response.ok {
            Ok(response)
        } else {
            Err(UpstreamError::Status { response })
        }
    }

    async fn permissions(&self) -> Result<Permissions, UpstreamError> {
        let response = self.send_checked(self.client.get(self.url("/perms"))).await?;
        match response.body {
            Body::Json(value) => serde_json::from_value(value)
                .map_err(|e| UpstreamError::Unexpected(format!("bad permissions body: {e}"))),
            other => Err(UpstreamError::Unexpected(format!(
                "expected JSON permissions, got {other:?}"
            ))),
        }
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
}

fn parse_body(bytes: &[u8], is_json: bool) -> Body {
    if bytes.is_empty() {
        return Body::Empty;
    }
    if is_json && let Ok(value) = serde_json::from_slice(bytes) {
        return Body::Json(value);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Body::Text(text.to_string()),
        Err(_) => Body::Bytes(bytes.to_vec()),
    }
}

/// Query values go out as strings: scalars verbatim, arrays comma-joined,
/// objects as JSON. Nulls are omitted.
fn query_pairs(query: &serde_json::Map<String, serde_json::Value>) -> Vec<(String, String)> {
    query
        .iter()
        .filter_map(|(key, value)| {
            let encoded = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(scalar_string)
                    .collect::<Vec<_>>()
                    .join(","),
                other => scalar_string(other),
            };
            Some((key.clone(), encoded))
        })
        .collect()
}

fn scalar_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn method(method: ApiMethod) -> Method {
    match method {
        ApiMethod::Get => Method::GET,
        ApiMethod::Post => Method::POST,
        ApiMethod::Put => Method::PUT,
        ApiMethod::Patch => Method::PATCH,
        ApiMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl SessionClient for HttpSessionClient {
    async fn restore_session(&self) -> Result<Option<Identity>, UpstreamError> {
        let response = match self.send_checked(self.client.get(self.url("/auth"))).await {
            Ok(response) => response,
            Err(e) if e.status() == Some(404) => return Ok(None),
            Err(e) => return Err(e),
        };
        match response.body {
            Body::Json(value) => serde_json::from_value::<AuthInfo>(value)
                .map(|info| Some(info.into()))
                .map_err(|e| UpstreamError::Unexpected(format!("bad auth body: {e}"))),
            other => Err(UpstreamError::Unexpected(format!(
                "expected JSON auth info, got {other:?}"
            ))),
        }
    }

    async fn log_in(&self, login: &str, password: &str) -> Result<Identity, UpstreamError> {
        self.send_checked(
            self.client
                .put(self.url("/auth"))
                .json(&json!({ "login": login, "password": password })),
        )
        .await?;
        self.restore_session()
            .await?
            .ok_or_else(|| UpstreamError::Unexpected("no session after login".to_string()))
    }

    async fn log_out(&self) -> Result<(), UpstreamError> {
        self.send_checked(self.client.delete(self.url("/auth")))
            .await
            .map(drop)
    }

    async fn totp(
        &self,
        code: &str,
        secret: Option<&[u8]>,
        remember: bool,
    ) -> Result<(), UpstreamError> {
        let mut body = json!({ "totpCode": code, "remember": remember });
        if let Some(secret) = secret {
            body["totpSecret"] = base64::engine::general_purpose::STANDARD
                .encode(secret)
                .into();
        }
        self.send_checked(self.client.post(self.url("/auth/totp")).json(&body))
            .await
            .map(drop)
    }

    async fn totp_remove(&self) -> Result<(), UpstreamError> {
        self.send_checked(self.client.delete(self.url("/auth/totp")))
            .await
            .map(drop)
    }

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, UpstreamError> {
        let mut builder = self
            .client
            .request(method(request.method), self.url(&request.path))
            .query(&query_pairs(&request.query));

        if request.files.is_empty() {
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
        } else {
            let mut form = reqwest::multipart::Form::new();
            if let Some(body) = &request.body {
                form = form.text("req", body.to_string());
            }
            for file in request.files {
                let part = reqwest::multipart::Part::bytes(file.data)
                    .file_name(file.name.clone())
                    .mime_str(&file.content_type)?;
                form = form.part(file.name, part);
            }
            builder = builder.multipart(form);
        }

        self.send(builder).await
    }

    async fn has_perms(&self, perms: &[String]) -> Result<Vec<bool>, UpstreamError> {
        let granted = self.permissions().await?;
        Ok(perms.iter().map(|p| granted.has_perm(p)).collect())
    }

    async fn has_codeholder_fields(
        &self,
        fields: &[FieldAccess],
    ) -> Result<Vec<bool>, UpstreamError> {
        let granted = self.permissions().await?;
        Ok(fields
            .iter()
            .map(|f| granted.has_codeholder_field(f))
            .collect())
    }

    async fn has_own_codeholder_fields(
        &self,
        fields: &[FieldAccess],
    ) -> Result<Vec<bool>, UpstreamError> {
        let granted = self.permissions().await?;
        Ok(fields
            .iter()
            .map(|f| granted.has_own_codeholder_field(f))
            .collect())
    }
}
