//! Burrow wire protocol
//!
//! Address types, V1 frame encoding and the resumable frame parser shared by
//! the relay and the device side of a tunnel.

pub mod addr;
pub mod frame;
pub mod parser;

pub use addr::{Addr, Scheme, Termination, TUNNEL_NETWORK};
pub use frame::{encode_frame, encode_header, FrameError, MAX_HEADER_LEN, V1};
pub use parser::{Chunk, ParseError, Parser, Router};

/// Read buffer size used when pumping bytes between streams
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Read-ahead buffer size, large enough for a typical TLS ClientHello
pub const DEFAULT_PEEK_SIZE: usize = 1024;
