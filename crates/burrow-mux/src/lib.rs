//! Burrow stream multiplexing runtime
//!
//! Runs the wire protocol over a live tunnel: the [`Encoder`] frames local
//! streams onto the tunnel, the [`Decoder`] routes incoming frames, and the
//! [`Listener`] turns every remote stream into an accepted [`Pipe`].

pub mod decoder;
pub mod encoder;
pub mod listener;
pub mod tunnel;

pub use decoder::{DecodeError, Decoder, RouteBytes};
pub use encoder::{EncodeError, Encoder};
pub use listener::{Listener, ListenerConfig, ListenerError, Pipe};
pub use tunnel::{dial, tunnel_url, TunnelConfig, TunnelError, WsTunnel};
