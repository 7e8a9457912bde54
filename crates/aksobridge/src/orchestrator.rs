//! Worker process spawning and per-slot control plumbing.
//!
//! Each slot gets a child process plus two background tasks: one forwarding
//! control responses from the child's stdout, and one waiting on the process
//! so the supervisor learns about exits. Every event is tagged with the slot
//! and the generation of the process that produced it.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ControlResponse, WorkerInit};

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub slot: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker with stdin and stdout piped.
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Re-runs the current executable with the hidden `worker` subcommand.
pub struct SelfSpawner;

impl WorkerSpawner for SelfSpawner {
    fn spawn(&self, _config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command.arg("worker");
        spawn_piped(command)
    }
}

/// Spawn with the control channel on stdin/stdout.
///
/// The child gets its own process group so a terminal Ctrl-C only reaches
/// the supervisor, which then closes workers in order.
pub fn spawn_piped(mut command: Command) -> Result<Child, SpawnError> {
    command.as_std_mut().process_group(0);
    let child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Something happened to the worker in `slot`.
#[derive(Debug)]
pub enum SlotEvent {
    Control {
        slot: usize,
        generation: u64,
        response: ControlResponse,
    },
    /// The worker's stdout reached EOF or failed to decode.
    ChannelClosed { slot: usize, generation: u64 },
    /// `status` is `None` when waiting on the process failed.
    Exited {
        slot: usize,
        generation: u64,
        status: Option<ExitStatus>,
    },
}

/// Supervisor-side handle to one running worker.
pub struct WorkerHandle {
    pub slot: usize,
    pub generation: u64,
    pub pid: Option<u32>,
    ctrl_writer: FramedWrite<ChildStdin, JsonCodec<ControlRequest>>,
    terminate: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub async fn send(&mut self, request: ControlRequest) -> io::Result<()> {
        self.ctrl_writer.send(request).await
    }

    /// Kill the process. An `Exited` event follows once it has been reaped.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn a worker for `init.slot` and send it `Init`.
pub async fn spawn_worker(
    spawner: &dyn WorkerSpawner,
    init: WorkerInit,
    generation: u64,
    events: mpsc::UnboundedSender<SlotEvent>,
) -> Result<WorkerHandle, SpawnError> {
    let slot = init.slot;
    let mut child = spawner.spawn(&WorkerSpawnConfig { slot })?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

    let mut ctrl_writer = FramedWrite::new(stdin, JsonCodec::<ControlRequest>::new());
    let mut ctrl_reader = FramedRead::new(stdout, JsonCodec::<ControlResponse>::new());

    let (terminate_tx, terminate_rx) = oneshot::channel();
    tokio::spawn(monitor_process(
        child,
        slot,
        generation,
        terminate_rx,
        events.clone(),
    ));

    tokio::spawn(async move {
        loop {
            match ctrl_reader.next().await {
                Some(Ok(response)) => {
                    let event = SlotEvent::Control {
                        slot,
                        generation,
                        response,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(slot, generation, error = %e, "Worker control channel error");
                    let _ = events.send(SlotEvent::ChannelClosed { slot, generation });
                    break;
                }
                None => {
                    let _ = events.send(SlotEvent::ChannelClosed { slot, generation });
                    break;
                }
            }
        }
        tracing::trace!(slot, generation, "Control reader task exiting");
    });

    tracing::debug!(slot, generation, ?pid, "Sending Init to worker");
    ctrl_writer.send(ControlRequest::Init(init)).await?;

    Ok(WorkerHandle {
        slot,
        generation,
        pid,
        ctrl_writer,
        terminate: Some(terminate_tx),
    })
}

async fn monitor_process(
    mut child: Child,
    slot: usize,
    generation: u64,
    terminate: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<SlotEvent>,
) {
    // A dropped handle counts as a terminate request.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = terminate => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(slot, generation, error = %e, "Kill failed (already exited?)");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(slot, generation, error = %e, "Failed to wait on worker");
            None
        }
    };
    let _ = events.send(SlotEvent::Exited {
        slot,
        generation,
        status,
    });
}
