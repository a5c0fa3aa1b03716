//! Headless node agent for the Verge control plane.
//!
//! The crate is organized around the long-lived session:
//! - `session`: login, credential state and re-authentication.
//! - `stream`: server-to-client event stream, reconnect backoff and invalidation.
//! - `rpc`: JSON-RPC envelope parsing and inbound method handlers.
//! - `reporter`: outbound device, shadow, product and metadata reports.
//! - `registry` / `library`: device registry boundary and local resource files.
//! - `retry`, `rest`, `config`: shared plumbing.

/// Agent configuration loading and validation.
pub mod config;
/// Local resource library and product catalog.
pub mod library;
/// Device registry and shadow store boundary.
pub mod registry;
/// Outbound reports.
pub mod reporter;
/// Control-plane REST envelope.
pub mod rest;
/// Reconnect and retry policies.
pub mod retry;
/// Inbound command dispatch.
pub mod rpc;
/// Session controller and credentials.
pub mod session;
/// Event stream framing, transport and supervision.
pub mod stream;

pub use config::AgentConfig;
pub use reporter::{ReportError, Reporter};
pub use retry::ReconnectPolicy;
pub use rpc::{DispatchError, Dispatcher, HandlerContext, HandlerRegistry};
pub use session::{CredentialCell, Credentials, SessionConfig, SessionController};
pub use stream::{StreamManager, StreamPhase, StreamSignal};
