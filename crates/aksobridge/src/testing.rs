//! Test doubles for the session layer and a minimal wire client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::{
    ApiRequest, ApiResponse, Body, CookieRecorder, FieldAccess, Identity, SessionClient,
    SessionFactory, UpstreamError,
};
use crate::wire::MAGIC;
use crate::wire::frame::tests::client_frame;

pub(crate) struct MockFactory {
    base: Url,
    identity: Option<Identity>,
    handshake_delay: Duration,
    fail_restore: bool,
    last_ip: Mutex<Option<String>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self {
            base: Url::parse("https://api.test").unwrap(),
            identity: None,
            handshake_delay: Duration::ZERO,
            fail_restore: false,
            last_ip: Mutex::new(None),
        }
    }

    pub(crate) fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub(crate) fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    pub(crate) fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    pub(crate) fn last_ip(&self) -> Option<String> {
        self.last_ip.lock().unwrap().clone()
    }
}

impl SessionFactory for MockFactory {
    fn base_url(&self) -> &Url {
        &self.base
    }

    fn open(
        &self,
        cookies: Arc<CookieRecorder>,
        client_ip: &str,
    ) -> Result<Arc<dyn SessionClient>, UpstreamError> {
        *self.last_ip.lock().unwrap() = Some(client_ip.to_string());
        Ok(Arc::new(MockSession {
            base: self.base.clone(),
            identity: self.identity.clone(),
            restore_delay: self.handshake_delay,
            fail_restore: self.fail_restore,
            cookies: Some(cookies),
        }))
    }
}

/// Scripted session.
///
/// `request` routes on path: `/echo`, `/status/<code>`, `/slow/<ms>`,
/// `/cookies/<n>` and `/broken`.
pub(crate) struct MockSession {
    base: Url,
    identity: Option<Identity>,
    restore_delay: Duration,
    fail_restore: bool,
    cookies: Option<Arc<CookieRecorder>>,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        Self {
            base: Url::parse("https://api.test").unwrap(),
            identity: None,
            restore_delay: Duration::ZERO,
            fail_restore: false,
            cookies: None,
        }
    }

    fn set_cookies(&self, values: Vec<String>) {
        let Some(cookies) = &self.cookies else {
            return;
        };
        let headers: Vec<HeaderValue> = values
            .iter()
            .map(|v| HeaderValue::from_str(v).unwrap())
            .collect();
        cookies.set_cookies(&mut headers.iter(), &self.base);
    }
}

fn json_response(status: u16, body: serde_json::Value) -> ApiResponse {
    ApiResponse {
        ok: (200..300).contains(&status),
        status,
        headers: [("content-type".to_string(), "application/json".to_string())].into(),
        body: Body::Json(body),
    }
}

#[async_trait]
impl SessionClient for MockSession {
    async fn restore_session(&self) -> Result<Option<Identity>, UpstreamError> {
        if !self.restore_delay.is_zero() {
            tokio::time::sleep(self.restore_delay).await;
        }
        if self.fail_restore {
            return Err(UpstreamError::Unexpected("restore failed".to_string()));
        }
        Ok(self.identity.clone())
    }

    async fn log_in(&self, login: &str, password: &str) -> Result<Identity, UpstreamError> {
        match (login, password) {
            ("nopw", _) => Err(UpstreamError::from_status(409)),
            (_, "pw") => {
                self.set_cookies(vec!["akso_session=fresh; Path=/".to_string()]);
                Ok(Identity {
                    id: 1,
                    uea: login.to_string(),
                    totp_pending: false,
                })
            }
            _ => Err(UpstreamError::from_status(401)),
        }
    }

    async fn log_out(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn totp(
        &self,
        code: &str,
        _secret: Option<&[u8]>,
        _remember: bool,
    ) -> Result<(), UpstreamError> {
        match code.parse::<u16>() {
            Ok(status) if status >= 400 => Err(UpstreamError::from_status(status)),
            _ => Ok(()),
        }
    }

    async fn totp_remove(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, UpstreamError> {
        let path = request.path.as_str();
        if let Some(status) = path.strip_prefix("/status/") {
            let status = status.parse().unwrap();
            return Err(UpstreamError::from_status(status));
        }
        if let Some(ms) = path.strip_prefix("/slow/") {
            let ms: u64 = ms.parse().unwrap();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(json_response(200, serde_json::json!({ "slept": ms })));
        }
        if let Some(n) = path.strip_prefix("/cookies/") {
            let n: usize = n.parse().unwrap();
            self.set_cookies((0..n).map(|i| format!("c{i}=v{i}; Path=/")).collect());
            return Ok(ApiResponse {
                ok: true,
                status: 204,
                headers: Default::default(),
                body: Body::Empty,
            });
        }
        if path == "/broken" {
            return Err(UpstreamError::Unexpected("broken".to_string()));
        }
        Ok(json_response(
            200,
            serde_json::json!({ "method": request.method.as_str(), "path": path }),
        ))
    }

    async fn has_perms(&self, perms: &[String]) -> Result<Vec<bool>, UpstreamError> {
        Ok(perms.iter().map(|p| p == "granted").collect())
    }

    async fn has_codeholder_fields(
        &self,
        fields: &[FieldAccess],
    ) -> Result<Vec<bool>, UpstreamError> {
        Ok(fields.iter().map(|f| f.flags == "r").collect())
    }

    async fn has_own_codeholder_fields(
        &self,
        fields: &[FieldAccess],
    ) -> Result<Vec<bool>, UpstreamError> {
        Ok(fields.iter().map(|f| f.flags.chars().all(|c| "rw".contains(c))).collect())
    }
}

/// Speaks the client side of the wire protocol.
pub(crate) struct TestClient<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    /// Write the preamble and return the client.
    pub(crate) async fn connect(mut stream: S) -> Self {
        stream.write_all(MAGIC).await.unwrap();
        Self { stream }
    }

    pub(crate) fn raw(stream: S) -> Self {
        Self { stream }
    }

    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub(crate) async fn shutdown(&mut self) {
        self.stream.shutdown().await.unwrap();
    }

    pub(crate) async fn send(&mut self, entries: Vec<(&str, Value)>) {
        let frame = client_frame(entries);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub(crate) async fn hi(&mut self, id: &str) {
        self.send(vec![
            ("t", Value::from("hi")),
            ("i", Value::from(id)),
            ("ip", Value::from("127.0.0.1")),
            ("co", Value::Map(vec![])),
        ])
        .await;
    }

    /// Next server frame, or `None` once the server has closed.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        let mut len = [0u8; 4];
        match self.stream.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => panic!("read failed: {e}"),
        }
        let len = i32::from_le_bytes(len);
        assert!(len >= 0, "server sent negative length");
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        let mut rd = &body[..];
        let value = rmpv::decode::read_value(&mut rd).unwrap();
        assert!(rd.is_empty(), "frame length does not match body");
        Some(value)
    }
}

pub(crate) fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

pub(crate) fn tag(value: &Value) -> &str {
    field(value, "t").and_then(Value::as_str).unwrap_or("")
}
