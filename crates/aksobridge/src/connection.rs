//! Per-connection protocol engine.
//!
//! One task per accepted socket drives everything the connection owns:
//!
//! ```text
//!   bytes ──▶ FrameCodec ──▶ dispatch ──▶ in-flight handlers ──▶ responses
//!                              │                 │
//!                         handshake gate    Set-Cookie queue ──(debounce)──▶ co frame
//! ```
//!
//! Handlers run concurrently inside a [`FuturesUnordered`] polled by the same
//! task, so responses go out in completion order and every write happens from
//! one place. The idle timer is reset by incoming bytes only.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedWrite};

use crate::handlers::{self, HandlerError};
use crate::session::{SessionClient, SessionFactory};
use crate::wire::{
    CorrelationId, FrameCodec, Message, Outbound, Reply, Request, RequestKind, codes,
};

/// Time without incoming bytes before a heartbeat or an idle close.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Window over which upstream cookie changes are coalesced into one frame.
pub const COOKIE_DEBOUNCE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub idle_timeout: Duration,
    pub cookie_debounce: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            cookie_debounce: COOKIE_DEBOUNCE,
        }
    }
}

enum Phase {
    AwaitingHandshake,
    Handshaking,
    Ready(Arc<dyn SessionClient>),
}

enum Outcome {
    Handshake(Result<(Arc<dyn SessionClient>, Reply), HandlerError>),
    Reply(Result<Reply, HandlerError>),
}

type InFlight = Pin<Box<dyn Future<Output = (CorrelationId, Outcome)> + Send>>;

pub struct Connection<S> {
    reader: ReadHalf<S>,
    writer: FramedWrite<WriteHalf<S>, FrameCodec>,
    decoder: FrameCodec,
    buf: BytesMut,
    factory: Arc<dyn SessionFactory>,
    config: ConnectionConfig,
    phase: Phase,
    in_flight: FuturesUnordered<InFlight>,
    cookie_tx: mpsc::UnboundedSender<String>,
    cookie_rx: mpsc::UnboundedReceiver<String>,
    cookies: Vec<String>,
    debounce_armed: bool,
    ended: bool,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    pub fn new(stream: S, factory: Arc<dyn SessionFactory>, config: ConnectionConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (cookie_tx, cookie_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            writer: FramedWrite::new(writer, FrameCodec::new()),
            decoder: FrameCodec::new(),
            buf: BytesMut::with_capacity(8 * 1024),
            factory,
            config,
            phase: Phase::AwaitingHandshake,
            in_flight: FuturesUnordered::new(),
            cookie_tx,
            cookie_rx,
            cookies: Vec::new(),
            debounce_armed: false,
            ended: false,
        }
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self) {
        let idle = time::sleep(self.config.idle_timeout);
        let debounce = time::sleep(Duration::ZERO);
        tokio::pin!(idle, debounce);

        while !self.ended {
            tokio::select! {
                biased;

                read = self.reader.read_buf(&mut self.buf) => match read {
                    Ok(0) => {
                        tracing::debug!("Peer closed connection");
                        self.flush_cookies().await;
                        self.ended = true;
                    }
                    Ok(_) => {
                        idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                        self.process_input().await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Connection read failed");
                        self.ended = true;
                    }
                },

                Some((id, outcome)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(id, outcome).await;
                }

                Some(cookie) = self.cookie_rx.recv() => {
                    self.cookies.push(cookie);
                    if !self.debounce_armed {
                        self.debounce_armed = true;
                        debounce.as_mut().reset(Instant::now() + self.config.cookie_debounce);
                    }
                }

                () = &mut debounce, if self.debounce_armed => {
                    self.flush_cookies().await;
                }

                () = &mut idle => {
                    if self.in_flight.is_empty() {
                        tracing::debug!("Connection idle, closing");
                        self.close(codes::IDLE_TIMEOUT, "timed out").await;
                    } else {
                        tracing::trace!(outstanding = self.in_flight.len(), "Heartbeat");
                        self.send(Outbound::Heartbeat).await;
                        idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                    }
                }
            }
        }

        if !self.in_flight.is_empty() {
            tracing::debug!(
                outstanding = self.in_flight.len(),
                "Dropping unfinished handlers"
            );
        }
    }

    async fn process_input(&mut self) {
        while !self.ended {
            match self.decoder.decode(&mut self.buf) {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => break,
                Err(e) => match e.code() {
                    Some(code) => {
                        tracing::debug!(code, error = %e, "Protocol error");
                        self.close(code, &e.to_string()).await;
                    }
                    None => {
                        tracing::debug!(error = %e, "Connection failed");
                        self.ended = true;
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, message: Message) {
        let Message { tag, id, fields } = message;
        let session = match &self.phase {
            Phase::Ready(session) => Some(Arc::clone(session)),
            _ => None,
        };
        let kind = RequestKind::from_tag(&tag);

        if session.is_none() && kind != Some(RequestKind::Handshake) {
            tracing::trace!(%tag, %id, "Dropping message before handshake");
            return;
        }
        let Some(kind) = kind else {
            self.close(codes::UNKNOWN_TYPE, &format!("unknown message type {tag}"))
                .await;
            return;
        };
        if kind == RequestKind::Handshake && !matches!(self.phase, Phase::AwaitingHandshake) {
            let message = HandlerError::DoubleHandshake.to_string();
            self.send(Outbound::Failure { id, message }).await;
            return;
        }

        let request = match Request::parse(kind, &fields) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(%tag, %id, error = %e, "Invalid request fields");
                let message = e.to_string();
                self.send(Outbound::Failure { id, message }).await;
                return;
            }
        };

        match (request, session) {
            (Request::Handshake { ip, cookies }, _) => {
                self.phase = Phase::Handshaking;
                let factory = Arc::clone(&self.factory);
                let queue = self.cookie_tx.clone();
                self.in_flight.push(Box::pin(async move {
                    let outcome = handlers::handshake(factory.as_ref(), &ip, &cookies, queue).await;
                    (id, Outcome::Handshake(outcome))
                }));
            }
            (Request::Exit, _) => {
                self.flush_cookies().await;
                self.send(Outbound::Success {
                    id,
                    reply: Reply::new(),
                })
                .await;
            }
            (request, Some(session)) => {
                self.in_flight.push(Box::pin(async move {
                    let outcome = handlers::dispatch(session.as_ref(), request).await;
                    (id, Outcome::Reply(outcome))
                }));
            }
            (_, None) => {}
        }
    }

    async fn complete(&mut self, id: CorrelationId, outcome: Outcome) {
        let result = match outcome {
            Outcome::Handshake(Ok((session, reply))) => {
                self.phase = Phase::Ready(session);
                Ok(reply)
            }
            Outcome::Handshake(Err(e)) => {
                self.phase = Phase::AwaitingHandshake;
                Err(e)
            }
            Outcome::Reply(result) => result,
        };

        let frame = match result {
            Ok(reply) => Outbound::Success { id, reply },
            Err(e) => {
                tracing::debug!(%id, error = %e, "Handler failed");
                Outbound::Failure {
                    id,
                    message: e.to_string(),
                }
            }
        };
        self.send(frame).await;
    }

    async fn flush_cookies(&mut self) {
        while let Ok(cookie) = self.cookie_rx.try_recv() {
            self.cookies.push(cookie);
        }
        self.debounce_armed = false;
        if self.cookies.is_empty() {
            return;
        }
        let cookies = std::mem::take(&mut self.cookies);
        tracing::trace!(count = cookies.len(), "Forwarding cookies");
        self.send(Outbound::Cookies(cookies)).await;
    }

    async fn send(&mut self, frame: Outbound) {
        if self.ended {
            return;
        }
        if let Err(e) = self.writer.send(frame).await {
            tracing::debug!(error = %e, "Connection write failed");
            self.ended = true;
        }
    }

    /// Report a transport error and close. Later calls are no-ops.
    async fn close(&mut self, code: u16, message: &str) {
        if self.ended {
            return;
        }
        self.flush_cookies().await;
        self.send(Outbound::TransportError {
            code,
            message: message.to_string(),
        })
        .await;
        if let Err(e) = self.writer.close().await {
            tracing::trace!(error = %e, "Shutdown after transport error failed");
        }
        self.ended = true;
    }
}

/// Serve one client with the default timings.
pub async fn serve<S>(stream: S, factory: Arc<dyn SessionFactory>)
where
    S: AsyncRead + AsyncWrite,
{
    Connection::new(stream, factory, ConnectionConfig::default())
        .run()
        .await
}
