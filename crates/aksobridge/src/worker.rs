//! Worker process - child side of the supervisor protocol.
//!
//! The parent side (spawning, respawning, shutdown) lives in orchestrator.rs
//! and supervisor.rs.
//!
//! Lifecycle:
//! 1. Read `Init` from the control channel (stdin)
//! 2. Bind `{dir}/ipc{slot}`, report `Listening`
//! 3. Accept connections, one task each, until `Close` or control EOF
//! 4. On `Close`: unbind, remove the socket file, wait a short grace period,
//!    report `Closed`, then idle until the supervisor terminates the process

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ControlResponse, WorkerInit};
use crate::bridge::transport::{bind_slot_listener, slot_socket_path};
use crate::connection;
use crate::session::{HttpSessionFactory, InvalidHost, SessionFactory};

/// Delay between unbinding and acknowledging `Close`.
pub const CLOSE_GRACE: Duration = Duration::from_millis(30);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("control channel failed: {0}")]
    Control(#[from] io::Error),

    #[error("control channel closed before init")]
    NoInit,

    #[error("expected init as first control message, got {0}")]
    UnexpectedControl(String),

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    InvalidHost(#[from] InvalidHost),
}

/// Run a worker over this process's stdin/stdout.
pub async fn run_worker() -> Result<(), WorkerError> {
    run_worker_io(stdin(), stdout(), |init| {
        let factory = HttpSessionFactory::new(&init.host, init.user_agent.clone())?;
        Ok(Arc::new(factory) as Arc<dyn SessionFactory>)
    })
    .await
}

/// Run a worker over an arbitrary control channel.
pub async fn run_worker_io<R, W, F>(reader: R, writer: W, make_factory: F) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(&WorkerInit) -> Result<Arc<dyn SessionFactory>, InvalidHost>,
{
    let mut ctrl_reader = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
    let ctrl_writer = FramedWrite::new(writer, JsonCodec::<ControlResponse>::new());

    let init = match ctrl_reader.next().await {
        Some(Ok(ControlRequest::Init(init))) => init,
        Some(Ok(other)) => return Err(WorkerError::UnexpectedControl(format!("{other:?}"))),
        Some(Err(e)) => return Err(WorkerError::Control(e)),
        None => return Err(WorkerError::NoInit),
    };

    let span = tracing::info_span!("worker", slot = init.slot);
    async move {
        let factory = make_factory(&init)?;
        serve_slot(&init, factory, ctrl_reader, ctrl_writer).await
    }
    .instrument(span)
    .await
}

async fn serve_slot<R, W>(
    init: &WorkerInit,
    factory: Arc<dyn SessionFactory>,
    mut ctrl_reader: FramedRead<R, JsonCodec<ControlRequest>>,
    mut ctrl_writer: FramedWrite<W, JsonCodec<ControlResponse>>,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let path = slot_socket_path(&init.dir, init.slot);
    let listener = bind_slot_listener(&path).map_err(|source| WorkerError::Bind {
        path: path.clone(),
        source,
    })?;
    tracing::info!(path = %path.display(), host = %init.host, "Worker listening");
    ctrl_writer
        .send(ControlResponse::Listening { path: path.clone() })
        .await?;

    let mut accepted: u64 = 0;
    loop {
        tokio::select! {
            biased;

            ctrl_msg = ctrl_reader.next() => {
                match ctrl_msg {
                    Some(Ok(ControlRequest::Close)) => {
                        tracing::info!("Close requested");
                        break;
                    }
                    Some(Ok(ControlRequest::Init(_))) => {
                        tracing::warn!("Received Init in accept loop (should be at startup)");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        remove_socket(&path);
                        return Err(e.into());
                    }
                    None => {
                        tracing::warn!("Control channel closed (supervisor died?), exiting");
                        remove_socket(&path);
                        return Ok(());
                    }
                }
            }

            conn = listener.accept() => {
                match conn {
                    Ok((stream, _)) => {
                        accepted += 1;
                        tracing::debug!(conn = accepted, "Accepted connection");
                        let span = tracing::debug_span!("conn", id = accepted);
                        tokio::spawn(
                            connection::serve(stream, Arc::clone(&factory)).instrument(span),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }

    drop(listener);
    remove_socket(&path);
    tokio::time::sleep(CLOSE_GRACE).await;
    ctrl_writer.send(ControlResponse::Closed).await?;
    tracing::debug!(accepted, "Listener closed");

    // Open connections keep running until the supervisor terminates us.
    while let Some(msg) = ctrl_reader.next().await {
        tracing::trace!(?msg, "Ignoring control message after close");
    }
    Ok(())
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
    }
}
