//! Supervisor-worker control bridge.
//!
//! The supervisor talks to each worker process over the child's stdin/stdout.
//! Nothing here is visible on the client wire protocol.
//!
//! - **protocol**: control message types (Init/Close, Listening/Closed)
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: socket directory layout shared by supervisor and workers

pub mod codec;
pub mod protocol;
pub mod transport;
