//! Socket directory layout.
//!
//! One filesystem socket per worker slot, all in one shared directory:
//! `{dir}/ipc{n}`. Clients discover candidates by listing the directory and
//! pick one by any policy.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

/// File name prefix shared by every slot socket.
pub const SOCKET_PREFIX: &str = "ipc";

/// Path of the socket for `slot` inside `dir`.
pub fn slot_socket_path(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("{SOCKET_PREFIX}{slot}"))
}

/// The shared socket directory, owned by the supervisor.
#[derive(Debug, Clone)]
pub struct SocketDir {
    dir: PathBuf,
}

impl SocketDir {
    /// Create the directory (and parents) with mode 0755.
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&dir)?;
        tracing::debug!(dir = %dir.display(), "Socket directory ready");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Remove the directory and anything left in it.
    pub fn cleanup(&self) -> io::Result<()> {
        if self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "Removing socket directory");
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Bind a listener at `path`, replacing a stale socket left by a crashed worker.
pub fn bind_slot_listener(path: &Path) -> io::Result<UnixListener> {
    use std::os::unix::net::UnixListener as StdUnixListener;

    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let std_listener = StdUnixListener::bind(path)?;
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;

    tracing::trace!(path = %path.display(), "Bound socket");
    Ok(listener)
}
