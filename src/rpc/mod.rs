//! Inbound command handling for stream payloads.

pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod product_import;
pub mod proto;

pub use context::{HandlerContext, RpcContext};
pub use dispatcher::{DispatchError, Dispatcher, Handler, HandlerError, HandlerFuture, HandlerRegistry};
pub use product_import::ImportError;
pub use proto::{RpcEnvelope, JSONRPC_VERSION};
