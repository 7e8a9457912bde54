//! aksobridge: Unix socket gateway to authenticated AKSO API sessions.
//!
//! A supervisor keeps one worker process per CPU. Each worker listens on
//! its own socket in a shared directory and runs one protocol engine per
//! client connection, bridging requests onto an upstream HTTP session.

pub mod bridge;
pub mod connection;
pub mod handlers;
pub mod orchestrator;
pub mod session;
pub mod supervisor;
mod version;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionConfig};
pub use session::{HttpSessionFactory, SessionClient, SessionFactory};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError, shutdown_signal};
pub use version::{AKSOBRIDGE_VERSION, user_agent};
pub use worker::{WorkerError, run_worker};
