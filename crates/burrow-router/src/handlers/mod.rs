//! Route handlers
//!
//! - `forward`: raw byte forwarding to a TCP target
//! - `proxy`: HTTP/1.1 reverse proxy
//! - `tls`: TLS termination in front of another handler

pub mod forward;
pub mod proxy;
pub mod tls;
