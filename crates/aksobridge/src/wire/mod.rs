//! Client wire protocol.
//!
//! After a one-time 4-byte preamble (`abx1`), both directions carry frames of
//! `[i32 LE length][MessagePack map]`. Every request map has a `t` type tag and
//! an `i` correlation id; responses echo the id.
//!
//! - **frame**: preamble check, reassembly, length bounds, outbound encoding
//! - **message**: decoded envelopes, typed requests, outbound frames
//! - **value**: MessagePack field access and JSON conversion

pub mod frame;
pub mod message;
pub mod value;

pub use frame::{FrameCodec, FrameError};
pub use message::{CorrelationId, Message, Outbound, Reply, Request, RequestKind};
pub use value::{FieldError, Fields};

/// Preamble every client writes once before its first frame.
pub const MAGIC: &[u8; 4] = b"abx1";

/// Largest accepted frame body (10 MiB).
pub const MAX_MESSAGE_LEN: usize = 10 * 1024 * 1024;

/// Transport error codes carried in `TXERR` frames.
pub mod codes {
    pub const IDLE_TIMEOUT: u16 = 103;
    pub const UNKNOWN_TYPE: u16 = 200;
    pub const BAD_MAGIC: u16 = 400;
    pub const BAD_LENGTH: u16 = 401;
    pub const DECODE: u16 = 402;
}

/// Server-emitted type tags.
pub mod tags {
    pub const SUCCESS: &str = "~";
    pub const FAILURE: &str = "~!";
    pub const TRANSPORT_ERROR: &str = "TXERR";
    pub const HEARTBEAT: &str = "\u{2764}";
    pub const COOKIES: &str = "co";
}
