//! Worker pool supervisor.
//!
//! Owns one worker process per slot and keeps the pool at its fixed size:
//! a worker that exits while the pool is open is replaced in the same slot
//! right away. A slot whose respawn fails is retried on a timer until it
//! holds a worker again. Shutdown asks every worker to close, waits for the
//! acknowledgements under a timeout, kills what is left and removes the
//! socket directory.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::bridge::protocol::{ControlRequest, ControlResponse, WorkerInit};
use crate::bridge::transport::SocketDir;
use crate::orchestrator::{SelfSpawner, SlotEvent, SpawnError, WorkerHandle, WorkerSpawner, spawn_worker};
use crate::session::{HttpSessionFactory, InvalidHost};
use crate::version::user_agent;

/// How long shutdown waits for each phase (close acks, then reaping).
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between attempts to refill a slot whose respawn failed.
pub const DEFAULT_RESPAWN_RETRY: Duration = Duration::from_secs(1);

pub struct SupervisorConfig {
    pub dir: PathBuf,
    pub host: String,
    pub user_agent: String,
    pub num_workers: usize,
    pub close_timeout: Duration,
    pub respawn_retry: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl SupervisorConfig {
    /// One worker per logical CPU, spawned from the current executable.
    pub fn new(dir: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            dir: dir.into(),
            host: host.into(),
            user_agent: user_agent(),
            num_workers,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            respawn_retry: DEFAULT_RESPAWN_RETRY,
            spawner: Arc::new(SelfSpawner),
        }
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_respawn_retry(mut self, interval: Duration) -> Self {
        self.respawn_retry = interval;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    InvalidHost(#[from] InvalidHost),

    #[error("failed to create socket directory: {0}")]
    SocketDir(#[source] std::io::Error),

    #[error("failed to spawn worker {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: SpawnError,
    },

    #[error("failed to remove socket directory: {0}")]
    Cleanup(#[source] std::io::Error),
}

pub struct Supervisor {
    config: SupervisorConfig,
    socket_dir: SocketDir,
    slots: Vec<Option<WorkerHandle>>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<SlotEvent>,
    events_rx: mpsc::UnboundedReceiver<SlotEvent>,
    closing: bool,
    closed: bool,
}

impl Supervisor {
    /// Create the socket directory and spawn every slot.
    ///
    /// The upstream host is validated first; every worker would fail on it.
    pub async fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        HttpSessionFactory::new(&config.host, config.user_agent.clone())?;
        let socket_dir = SocketDir::create(&config.dir).map_err(SupervisorError::SocketDir)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut supervisor = Self {
            socket_dir,
            slots: Vec::with_capacity(config.num_workers),
            next_generation: 0,
            events_tx,
            events_rx,
            closing: false,
            closed: false,
            config,
        };

        tracing::info!(
            workers = supervisor.config.num_workers,
            dir = %supervisor.socket_dir.path().display(),
            host = %supervisor.config.host,
            "Starting worker pool"
        );
        for slot in 0..supervisor.config.num_workers {
            let handle = supervisor.spawn_slot(slot).await?;
            supervisor.slots.push(Some(handle));
        }
        Ok(supervisor)
    }

    pub fn num_workers(&self) -> usize {
        self.slots.len()
    }

    /// Pid of the worker currently serving `slot`.
    pub fn worker_pid(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot)?.as_ref()?.pid
    }

    async fn spawn_slot(&mut self, slot: usize) -> Result<WorkerHandle, SupervisorError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let init = WorkerInit {
            slot,
            dir: self.socket_dir.path().to_path_buf(),
            host: self.config.host.clone(),
            user_agent: self.config.user_agent.clone(),
        };
        let handle = spawn_worker(
            self.config.spawner.as_ref(),
            init,
            generation,
            self.events_tx.clone(),
        )
        .await
        .map_err(|source| SupervisorError::Spawn { slot, source })?;

        tracing::debug!(slot, generation, pid = ?handle.pid, "Worker spawned");
        Ok(handle)
    }

    fn live_workers(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn is_current(&self, slot: usize, generation: u64) -> bool {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|h| h.generation == generation)
    }

    /// Supervise until `shutdown` resolves, then shut the pool down.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut retry = tokio::time::interval(self.config.respawn_retry);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => break,

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                _ = retry.tick(), if self.live_workers() < self.slots.len() => {
                    self.fill_vacant_slots().await;
                }
            }
        }
        self.shutdown().await
    }

    async fn handle_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Control {
                slot,
                generation,
                response: ControlResponse::Listening { path },
            } => {
                tracing::info!(slot, generation, path = %path.display(), "Worker listening");
            }
            SlotEvent::Control {
                slot,
                generation,
                response,
            } => {
                tracing::debug!(slot, generation, ?response, "Unexpected control message");
            }
            SlotEvent::ChannelClosed { slot, generation } => {
                tracing::debug!(slot, generation, "Worker control channel closed");
            }
            SlotEvent::Exited {
                slot,
                generation,
                status,
            } => {
                if !self.is_current(slot, generation) {
                    tracing::trace!(slot, generation, "Ignoring exit of replaced worker");
                    return;
                }
                if self.closing {
                    return;
                }
                tracing::warn!(slot, generation, ?status, "Worker exited, respawning");
                match self.spawn_slot(slot).await {
                    Ok(handle) => self.slots[slot] = Some(handle),
                    Err(e) => {
                        self.slots[slot] = None;
                        tracing::error!(
                            slot,
                            live = self.live_workers(),
                            workers = self.slots.len(),
                            error = %e,
                            "Failed to respawn worker, pool degraded until retry succeeds"
                        );
                    }
                }
            }
        }
    }

    async fn fill_vacant_slots(&mut self) {
        for slot in 0..self.slots.len() {
            if self.closing {
                return;
            }
            if self.slots[slot].is_some() {
                continue;
            }
            match self.spawn_slot(slot).await {
                Ok(handle) => {
                    tracing::info!(slot, "Vacant slot refilled");
                    self.slots[slot] = Some(handle);
                }
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Respawn retry failed");
                }
            }
        }
    }

    /// Close every worker and remove the socket directory. Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        if self.closed {
            return Ok(());
        }
        self.closing = true;
        tracing::info!(workers = self.slots.len(), "Shutting down worker pool");

        let mut awaiting_close = HashSet::new();
        for handle in self.slots.iter_mut().flatten() {
            match handle.send(ControlRequest::Close).await {
                Ok(()) => {
                    awaiting_close.insert((handle.slot, handle.generation));
                }
                Err(e) => {
                    tracing::debug!(slot = handle.slot, error = %e, "Could not send Close");
                }
            }
        }

        let mut exited = HashSet::new();
        let close_timeout = self.config.close_timeout;
        let acked = tokio::time::timeout(close_timeout, async {
            while !awaiting_close.is_empty() {
                let Some(event) = self.events_rx.recv().await else {
                    break;
                };
                match event {
                    SlotEvent::Control {
                        slot,
                        generation,
                        response: ControlResponse::Closed,
                    }
                    | SlotEvent::ChannelClosed { slot, generation } => {
                        awaiting_close.remove(&(slot, generation));
                    }
                    SlotEvent::Exited {
                        slot, generation, ..
                    } => {
                        awaiting_close.remove(&(slot, generation));
                        exited.insert((slot, generation));
                    }
                    SlotEvent::Control { .. } => {}
                }
            }
        })
        .await;
        if acked.is_err() {
            tracing::warn!(
                remaining = awaiting_close.len(),
                "Timed out waiting for workers to close"
            );
        }

        let mut awaiting_exit = HashSet::new();
        for handle in self.slots.iter_mut().flatten() {
            let key = (handle.slot, handle.generation);
            if !exited.contains(&key) {
                handle.terminate();
                awaiting_exit.insert(key);
            }
        }
        let reaped = tokio::time::timeout(close_timeout, async {
            while !awaiting_exit.is_empty() {
                match self.events_rx.recv().await {
                    Some(SlotEvent::Exited {
                        slot, generation, ..
                    }) => {
                        awaiting_exit.remove(&(slot, generation));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        if reaped.is_err() {
            tracing::warn!(remaining = awaiting_exit.len(), "Timed out reaping workers");
        }

        self.slots.clear();
        self.socket_dir.cleanup().map_err(SupervisorError::Cleanup)?;
        self.closed = true;
        tracing::info!("Worker pool shut down");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::WorkerSpawnConfig;
    use crate::orchestrator::tests::ShellSpawner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::process::Child;

    /// Fails the next `failures` spawns, then behaves like its shell spawner.
    struct FlakySpawner {
        shell: ShellSpawner,
        failures: AtomicUsize,
    }

    impl WorkerSpawner for FlakySpawner {
        fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SpawnError::Other("out of processes".to_string()));
            }
            self.shell.spawn(config)
        }
    }

    fn config(dir: PathBuf, spawner: ShellSpawner) -> SupervisorConfig {
        SupervisorConfig::new(dir, "https://api.test")
            .with_num_workers(2)
            .with_close_timeout(Duration::from_millis(500))
            .with_spawner(Arc::new(spawner))
    }

    #[test]
    fn default_config_uses_every_cpu() {
        let config = SupervisorConfig::new("aksobridge", "https://apitest.akso.org");
        assert!(config.num_workers >= 1);
        assert_eq!(config.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert_eq!(config.respawn_retry, DEFAULT_RESPAWN_RETRY);
        assert!(config.user_agent.starts_with("AKSOBridge/"));
    }

    #[tokio::test]
    async fn crashed_worker_is_replaced_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::start(config(
            tmp.path().join("bridge"),
            ShellSpawner("head -c 1 >/dev/null; exit 3"),
        ))
        .await
        .unwrap();
        assert_eq!(supervisor.num_workers(), 2);
        let first_pid = supervisor.worker_pid(0).unwrap();

        // drive the event loop until slot 0 has a new process
        tokio::time::timeout(Duration::from_secs(10), async {
            while supervisor.worker_pid(0) == Some(first_pid) {
                let event = supervisor.events_rx.recv().await.unwrap();
                supervisor.handle_event(event).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(supervisor.num_workers(), 2);
        assert!(supervisor.slots[0].as_ref().unwrap().generation >= 2);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_kills_workers_and_removes_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("bridge");
        let mut supervisor = Supervisor::start(config(dir.clone(), ShellSpawner("exec sleep 30")))
            .await
            .unwrap();
        assert!(dir.exists());

        let started = tokio::time::Instant::now();
        supervisor.run(async {}).await.unwrap();
        assert!(!dir.exists());
        assert_eq!(supervisor.num_workers(), 0);
        // close acks never come, so one timeout elapses before the kill
        assert!(started.elapsed() < Duration::from_secs(5));

        // second shutdown is a no-op
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_host_fails_startup_without_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("bridge");
        let config = SupervisorConfig::new(dir.clone(), "notaurl")
            .with_spawner(Arc::new(ShellSpawner("exec sleep 30")));

        let err = match Supervisor::start(config).await {
            Ok(_) => panic!("startup should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SupervisorError::InvalidHost(_)));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn failed_respawn_is_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = Arc::new(FlakySpawner {
            shell: ShellSpawner("head -c 1 >/dev/null; exit 3"),
            failures: AtomicUsize::new(0),
        });
        let mut supervisor = Supervisor::start(
            config(tmp.path().join("bridge"), ShellSpawner("unused"))
                .with_num_workers(1)
                .with_spawner(spawner.clone()),
        )
        .await
        .unwrap();

        // the worker exits on its own; its replacement fails to spawn
        spawner.failures.store(1, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = supervisor.events_rx.recv().await.unwrap();
                let exited = matches!(event, SlotEvent::Exited { .. });
                supervisor.handle_event(event).await;
                if exited {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(supervisor.worker_pid(0), None);
        assert_eq!(supervisor.live_workers(), 0);

        supervisor.fill_vacant_slots().await;
        assert!(supervisor.worker_pid(0).is_some());
        assert_eq!(supervisor.live_workers(), 1);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stale_exit_events_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::start(
            config(tmp.path().join("bridge"), ShellSpawner("exec sleep 30")).with_num_workers(1),
        )
        .await
        .unwrap();
        let pid = supervisor.worker_pid(0);

        supervisor
            .handle_event(SlotEvent::Exited {
                slot: 0,
                generation: 99,
                status: None,
            })
            .await;
        assert_eq!(supervisor.worker_pid(0), pid);

        supervisor.shutdown().await.unwrap();
    }
}
