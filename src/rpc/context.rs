use std::sync::Arc;

use futures_util::future::BoxFuture;
use reqwest::Client;
use secrecy::SecretString;

use crate::library::{ProductInfo, ResourceLibrary};
use crate::registry::DeviceRegistry;
use crate::reporter::ReportError;

/// Operations a command handler may invoke on the agent.
///
/// Handlers see reporting and the current credentials only; connection
/// management stays out of reach.
pub trait RpcContext: Send + Sync {
    fn report_devices<'a>(&'a self, device_ids: &'a [String]) -> BoxFuture<'a, Result<(), ReportError>>;

    fn report_shadows<'a>(&'a self, device_ids: &'a [String]) -> BoxFuture<'a, Result<(), ReportError>>;

    fn report_products<'a>(
        &'a self,
        products: &'a [ProductInfo],
    ) -> BoxFuture<'a, Result<(), ReportError>>;

    fn collect_and_report_products(&self) -> BoxFuture<'_, Result<(), ReportError>>;

    /// Control-plane base address, without a trailing slash. Empty before
    /// the first login.
    fn base_url(&self) -> String;

    /// Bearer token from the latest successful login.
    fn token(&self) -> Option<SecretString>;
}

/// Everything a handler receives besides its params.
#[derive(Clone)]
pub struct HandlerContext {
    rpc: Arc<dyn RpcContext>,
    registry: Arc<dyn DeviceRegistry>,
    library: ResourceLibrary,
    http: Client,
}

impl HandlerContext {
    pub fn new(
        rpc: Arc<dyn RpcContext>,
        registry: Arc<dyn DeviceRegistry>,
        library: ResourceLibrary,
        http: Client,
    ) -> Self {
        Self {
            rpc,
            registry,
            library,
            http,
        }
    }

    pub fn rpc(&self) -> &dyn RpcContext {
        self.rpc.as_ref()
    }

    pub fn registry(&self) -> &dyn DeviceRegistry {
        self.registry.as_ref()
    }

    pub fn library(&self) -> &ResourceLibrary {
        &self.library
    }

    pub fn http(&self) -> &Client {
        &self.http
    }
}
