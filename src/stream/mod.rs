//! Server-to-client event stream.
//!
//! - `frame`: line-oriented `data:` framing over a byte stream.
//! - `client`: opens the streaming HTTP request.
//! - `manager`: connection supervision, reconnect backoff and invalidation.

/// Event-stream line framing.
pub mod frame;
/// Streaming HTTP transport.
pub mod client;
/// Connection lifecycle state machine.
pub mod manager;

pub use client::{StreamClient, StreamConnectError};
pub use manager::{FrameHandler, StreamManager, StreamPhase, StreamSignal};
