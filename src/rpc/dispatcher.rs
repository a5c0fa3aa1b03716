//! Envelope validation and method routing.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::library::LibraryError;
use crate::registry::RegistryError;
use crate::reporter::ReportError;
use crate::rpc::context::HandlerContext;
use crate::rpc::handlers::STANDARD_HANDLERS;
use crate::rpc::product_import::ImportError;
use crate::rpc::proto::RpcEnvelope;
use crate::stream::FrameHandler;

pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), HandlerError>>;

/// A method handler. Each handler decodes its own params.
pub type Handler = for<'a> fn(&'a HandlerContext, Value) -> HandlerFuture<'a>;

/// Failures reported by method handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),

    #[error("missing params")]
    MissingParams,

    #[error("model hash mismatch for {key}: expected {expected}, computed {computed}")]
    HashMismatch {
        key: String,
        expected: String,
        computed: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

/// Failures of one inbound payload. None of them end the stream.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),

    #[error("handler for {method} failed: {source}")]
    HandlerFailed {
        method: String,
        #[source]
        source: HandlerError,
    },
}

/// Immutable method-name to handler table.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<&'static str, Handler>>,
}

impl HandlerRegistry {
    /// Registry with every built-in method.
    pub fn standard() -> Self {
        Self::from_entries(STANDARD_HANDLERS)
    }

    /// Later entries win on duplicate names.
    pub fn from_entries(entries: &[(&'static str, Handler)]) -> Self {
        Self {
            handlers: Arc::new(entries.iter().copied().collect()),
        }
    }

    pub fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).copied()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<&'static str> {
        let mut methods: Vec<&'static str> = self.handlers.keys().copied().collect();
        methods.sort_unstable();
        methods
    }
}

/// Parses stream payloads and routes them to handlers.
pub struct Dispatcher {
    registry: HandlerRegistry,
    context: HandlerContext,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, context: HandlerContext) -> Self {
        Self { registry, context }
    }

    /// Handles one raw payload.
    ///
    /// Unknown methods are logged and succeed.
    pub async fn handle(&self, raw: &str) -> Result<(), DispatchError> {
        let envelope = RpcEnvelope::from_text(raw).map_err(DispatchError::MalformedEnvelope)?;

        if !envelope.has_supported_version() {
            return Err(DispatchError::UnsupportedVersion(
                envelope.jsonrpc.unwrap_or_default(),
            ));
        }

        let Some(handler) = self.registry.get(&envelope.method) else {
            warn!(event = "rpc_unknown_method", method = %envelope.method);
            return Ok(());
        };

        debug!(event = "rpc_dispatch", method = %envelope.method, id = ?envelope.id);
        handler(&self.context, envelope.params)
            .await
            .map_err(|source| DispatchError::HandlerFailed {
                method: envelope.method,
                source,
            })
    }
}

impl FrameHandler for Dispatcher {
    fn handle_frame<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<(), DispatchError>> {
        self.handle(payload).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;
    use serde_json::Value;

    use super::*;
    use crate::rpc::context::testing::{fixture, Call};

    static PROBE_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn probe<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
        async move {
            PROBE_CALLS.fetch_add(1, Ordering::SeqCst);
            let ids: Vec<String> =
                serde_json::from_value(params).map_err(HandlerError::InvalidParams)?;
            cx.rpc().report_devices(&ids).await?;
            Ok(())
        }
        .boxed()
    }

    fn dispatcher(cx: HandlerContext) -> Dispatcher {
        Dispatcher::new(HandlerRegistry::from_entries(&[("test.probe", probe as Handler)]), cx)
    }

    #[test]
    fn standard_registry_lists_every_method() {
        assert_eq!(
            HandlerRegistry::standard().methods(),
            vec![
                "device.control",
                "devices.add",
                "devices.delete",
                "devices.report",
                "node.command",
                "node.configChanged",
                "node.networkStatus",
                "product.import",
                "products.report",
            ]
        );
    }

    #[tokio::test]
    async fn malformed_payloads_never_reach_a_handler() {
        let fx = fixture();
        let dispatcher = dispatcher(fx.handler.clone());
        let before = PROBE_CALLS.load(Ordering::SeqCst);

        for raw in ["", "not json", "{", "[1,2]", r#"{"params":["a"]}"#, r#"{"method":null}"#] {
            let result = dispatcher.handle(raw).await;
            assert!(
                matches!(result, Err(DispatchError::MalformedEnvelope(_))),
                "{raw:?} gave {result:?}"
            );
        }

        assert_eq!(PROBE_CALLS.load(Ordering::SeqCst), before);
        assert!(fx.context.calls().is_empty());
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let fx = fixture();
        let dispatcher = dispatcher(fx.handler.clone());
        let result = dispatcher
            .handle(r#"{"jsonrpc":"1.0","method":"test.probe","params":["a"]}"#)
            .await;
        assert!(matches!(result, Err(DispatchError::UnsupportedVersion(v)) if v == "1.0"));
        assert!(fx.context.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_method_is_ignored() {
        let fx = fixture();
        let dispatcher = dispatcher(fx.handler.clone());
        dispatcher
            .handle(r#"{"jsonrpc":"2.0","method":"node.reboot","params":{}}"#)
            .await
            .expect("unknown method succeeds");
        assert!(fx.context.calls().is_empty());
    }

    #[tokio::test]
    async fn known_method_receives_params() {
        let fx = fixture();
        let dispatcher = dispatcher(fx.handler.clone());
        dispatcher
            .handle(r#"{"jsonrpc":"2.0","method":"test.probe","params":["d1","d2"],"id":3}"#)
            .await
            .expect("dispatch");
        assert_eq!(
            fx.context.calls(),
            vec![Call::Devices(vec!["d1".to_string(), "d2".to_string()])]
        );
    }

    #[tokio::test]
    async fn handler_errors_are_wrapped_with_method() {
        let fx = fixture();
        let dispatcher = dispatcher(fx.handler.clone());
        let result = dispatcher
            .handle(r#"{"jsonrpc":"2.0","method":"test.probe","params":{"not":"a list"}}"#)
            .await;
        match result {
            Err(DispatchError::HandlerFailed { method, source }) => {
                assert_eq!(method, "test.probe");
                assert!(matches!(source, HandlerError::InvalidParams(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatcher_serves_as_frame_handler() {
        let fx = fixture();
        let dispatcher = dispatcher(fx.handler.clone());
        let handler: &dyn FrameHandler = &dispatcher;
        handler
            .handle_frame(r#"{"method":"test.probe","params":[]}"#)
            .await
            .expect("frame");
        assert_eq!(fx.context.calls(), vec![Call::Devices(Vec::new())]);
    }
}
