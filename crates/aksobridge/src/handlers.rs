//! Request handlers.
//!
//! Each handler turns one validated [`Request`] into a [`Reply`] using the
//! connection's [`SessionClient`]. Anticipated upstream statuses become
//! structured declined replies; everything else is a [`HandlerError`] and is
//! reported to the client as `~!`.

use std::sync::Arc;

use rmpv::Value;
use tokio::sync::mpsc;

use crate::session::{
    ApiResponse, Body, CookieRecorder, Identity, SessionClient, SessionFactory, UpstreamError,
};
use crate::wire::value::from_json;
use crate::wire::{FieldError, Reply, Request};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("double handshake")]
    DoubleHandshake,
}

/// Open the connection's session and restore whatever the cookies carry.
///
/// `queue` receives every `Set-Cookie` value the session sees from now on.
pub async fn handshake(
    factory: &dyn SessionFactory,
    ip: &str,
    cookies: &[(String, String)],
    queue: mpsc::UnboundedSender<String>,
) -> Result<(Arc<dyn SessionClient>, Reply), HandlerError> {
    tracing::debug!(ip, cookies = cookies.len(), "Connection handshake");

    let recorder = Arc::new(CookieRecorder::new(queue));
    recorder.seed(cookies, factory.base_url());
    let session = factory.open(recorder, ip)?;

    let reply = match session.restore_session().await? {
        Some(identity) => identity_reply(Reply::new().with("auth", true), identity),
        None => Reply::new().with("auth", false),
    };
    Ok((session, reply))
}

/// Run one post-handshake request against the session.
pub async fn dispatch(
    session: &dyn SessionClient,
    request: Request,
) -> Result<Reply, HandlerError> {
    match request {
        Request::Handshake { .. } => Err(HandlerError::DoubleHandshake),
        Request::Login { login, password } => log_in(session, &login, &password).await,
        Request::Logout => match session.log_out().await {
            Ok(()) => Ok(success(true)),
            Err(e) if e.status() == Some(404) => Ok(success(false)),
            Err(e) => Err(e.into()),
        },
        Request::Totp {
            code,
            secret,
            remember,
        } => totp(session, &code, secret.as_deref(), remember).await,
        Request::TotpRemove => match session.totp_remove().await {
            Ok(()) => Ok(success(true)),
            Err(e) if matches!(e.status(), Some(401 | 404)) => Ok(success(false)),
            Err(e) => Err(e.into()),
        },
        Request::Api(api) => {
            tracing::debug!(method = api.method.as_str(), path = %api.path, "API request");
            match session.request(api).await {
                Ok(response) | Err(UpstreamError::Status { response }) => Ok(api_reply(response)),
                Err(e) => Err(e.into()),
            }
        }
        Request::Perms(perms) => {
            let granted = session.has_perms(&perms).await?;
            Ok(Reply::new().with("p", bools(granted)))
        }
        Request::CodeholderFields(fields) => {
            let granted = session.has_codeholder_fields(&fields).await?;
            Ok(Reply::new().with("f", bools(granted)))
        }
        Request::OwnCodeholderFields(fields) => {
            let granted = session.has_own_codeholder_fields(&fields).await?;
            Ok(Reply::new().with("f", bools(granted)))
        }
        Request::Exit => Ok(Reply::new()),
    }
}

async fn log_in(
    session: &dyn SessionClient,
    login: &str,
    password: &str,
) -> Result<Reply, HandlerError> {
    match session.log_in(login, password).await {
        Ok(identity) => Ok(identity_reply(success(true), identity)),
        Err(e) => match e.status() {
            Some(401) => Ok(success(false).with("nopw", false)),
            // account exists but has no password set
            Some(409) => Ok(success(false).with("nopw", true)),
            _ => Err(e.into()),
        },
    }
}

async fn totp(
    session: &dyn SessionClient,
    code: &str,
    secret: Option<&[u8]>,
    remember: bool,
) -> Result<Reply, HandlerError> {
    let declined = |bad: bool, nosx: bool, noauth: bool| {
        success(false)
            .with("bad", bad)
            .with("nosx", nosx)
            .with("noauth", noauth)
    };
    match session.totp(code, secret, remember).await {
        Ok(()) => Ok(success(true)),
        Err(e) => match e.status() {
            Some(401) => Ok(declined(true, false, false)),
            Some(404) => Ok(declined(false, true, false)),
            Some(403) => Ok(declined(false, false, true)),
            _ => Err(e.into()),
        },
    }
}

fn success(s: bool) -> Reply {
    Reply::new().with("s", s)
}

fn identity_reply(reply: Reply, identity: Identity) -> Reply {
    reply
        .with("id", identity.id)
        .with("uea", identity.uea)
        .with("totp", identity.totp_pending)
}

fn bools(values: Vec<bool>) -> Value {
    Value::Array(values.into_iter().map(Value::from).collect())
}

fn api_reply(response: ApiResponse) -> Reply {
    let headers = Value::Map(
        response
            .headers
            .into_iter()
            .map(|(k, v)| (Value::from(k), Value::from(v)))
            .collect(),
    );
    let body = match response.body {
        Body::Empty => Value::Nil,
        Body::Json(json) => from_json(&json),
        Body::Text(text) => Value::from(text),
        Body::Bytes(bytes) => Value::Binary(bytes),
    };
    Reply::new()
        .with("k", response.ok)
        .with("sc", response.status)
        .with("h", headers)
        .with("b", body)
}
