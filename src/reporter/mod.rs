//! Outbound reports to the control plane.
//!
//! Every report is a `POST {base}/api/node/{sn}/{endpoint}` with bearer auth
//! and a JSON body; the reply is a `RestResult` that must carry `code == 200`.
//! Reports are single-shot; nothing here retries.

pub mod metadata;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::library::{LibraryError, ProductInfo, ResourceLibrary};
use crate::registry::{Device, DeviceModel, DeviceRegistry, DeviceShadow, Point, ShadowStore};
use crate::rest::{summarize_error_body, RestResult};
use crate::rpc::RpcContext;
use crate::session::CredentialCell;

pub use metadata::NodeMetadata;

pub const DEVICES_ENDPOINT: &str = "report/devices";
pub const SHADOWS_ENDPOINT: &str = "report/shadows";
pub const PRODUCTS_ENDPOINT: &str = "report/products";
pub const METADATA_ENDPOINT: &str = "report/metadata";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reporter not ready: no session credentials")]
    NotReady,

    #[error("report request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("{endpoint} http status {status}: {body}")]
    HttpStatus {
        endpoint: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to parse {endpoint} response: {source}")]
    Parse {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{endpoint} failed with code {code}: {message}")]
    Rejected {
        endpoint: String,
        code: i64,
        message: String,
    },

    #[error(transparent)]
    Library(#[from] LibraryError),
}

/// Model as embedded in a device report: everything but its device list.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelReport {
    pub name: String,
    pub model_id: String,
    pub description: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub device_points: Vec<Point>,
}

impl From<DeviceModel> for ModelReport {
    fn from(model: DeviceModel) -> Self {
        Self {
            name: model.name,
            model_id: model.model_id,
            description: model.description,
            extra: model.extra,
            device_points: model.device_points,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DeviceReport {
    pub name: String,
    #[serde(flatten)]
    pub device: Device,
    pub model: ModelReport,
    pub connections: Value,
    pub protocol: String,
}

pub struct Reporter {
    http: Client,
    serial_number: String,
    credentials: CredentialCell,
    registry: Arc<dyn DeviceRegistry>,
    shadows: Arc<dyn ShadowStore>,
    library: ResourceLibrary,
}

impl Reporter {
    pub fn new(
        http: Client,
        serial_number: impl Into<String>,
        credentials: CredentialCell,
        registry: Arc<dyn DeviceRegistry>,
        shadows: Arc<dyn ShadowStore>,
        library: ResourceLibrary,
    ) -> Self {
        Self {
            http,
            serial_number: serial_number.into(),
            credentials,
            registry,
            shadows,
            library,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.credentials.is_set()
    }

    /// Builds report entries, skipping devices whose model or connection is
    /// unknown.
    pub fn device_reports(&self, device_ids: &[String]) -> Vec<DeviceReport> {
        device_ids
            .iter()
            .filter_map(|id| {
                let Some(device) = self.registry.device(id) else {
                    error!(event = "report_device_missing", device = %id);
                    return None;
                };
                let Some(model) = self.registry.model(&device.model_name) else {
                    error!(event = "report_model_missing", device = %id, model = %device.model_name);
                    return None;
                };
                let Some(connection) = self.registry.connection(&device.connection_key) else {
                    error!(
                        event = "report_connection_missing",
                        device = %id,
                        connection = %device.connection_key
                    );
                    return None;
                };
                let protocol = self
                    .registry
                    .connection_plugin(&device.connection_key)
                    .unwrap_or_default();
                Some(DeviceReport {
                    name: device.description.clone(),
                    device,
                    model: model.into(),
                    connections: connection,
                    protocol,
                })
            })
            .collect()
    }

    pub fn shadow_reports(&self, device_ids: &[String]) -> Vec<DeviceShadow> {
        device_ids
            .iter()
            .filter_map(|id| {
                let shadow = self.shadows.shadow(id);
                if shadow.is_none() {
                    error!(event = "report_shadow_missing", device = %id);
                }
                shadow
            })
            .collect()
    }

    pub async fn report_devices(&self, device_ids: &[String]) -> Result<(), ReportError> {
        let devices = self.device_reports(device_ids);
        self.post_report(DEVICES_ENDPOINT, &devices).await
    }

    pub async fn report_shadows(&self, device_ids: &[String]) -> Result<(), ReportError> {
        info!(event = "report_shadows", devices = device_ids.len());
        let shadows = self.shadow_reports(device_ids);
        self.post_report(SHADOWS_ENDPOINT, &shadows).await
    }

    pub async fn report_products(&self, products: &[ProductInfo]) -> Result<(), ReportError> {
        info!(event = "report_products", products = products.len());
        self.post_report(PRODUCTS_ENDPOINT, products).await
    }

    /// Rebuilds the product catalog from the library and reports it.
    pub async fn collect_and_report_products(&self) -> Result<(), ReportError> {
        let products = self.library.collect_products()?;
        self.report_products(&products).await
    }

    pub async fn report_metadata(&self) -> Result<(), ReportError> {
        let metadata = NodeMetadata::collect(&self.serial_number);
        self.post_report(METADATA_ENDPOINT, &metadata).await
    }

    async fn post_report<T>(&self, endpoint: &str, payload: &T) -> Result<(), ReportError>
    where
        T: Serialize + ?Sized,
    {
        let credentials = self.credentials.current().ok_or(ReportError::NotReady)?;
        let url = format!(
            "{}/api/node/{}/{}",
            credentials.base_url, self.serial_number, endpoint
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(credentials.token.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(ReportError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ReportError::Transport)?;
        if !status.is_success() {
            return Err(ReportError::HttpStatus {
                endpoint: endpoint.to_string(),
                status,
                body: summarize_error_body(&body),
            });
        }

        let result = RestResult::from_text(&body).map_err(|source| ReportError::Parse {
            endpoint: endpoint.to_string(),
            source,
        })?;
        if !result.is_ok() {
            return Err(ReportError::Rejected {
                endpoint: endpoint.to_string(),
                code: result.code,
                message: result.message,
            });
        }

        debug!(event = "report_succeeded", endpoint);
        Ok(())
    }
}

impl RpcContext for Reporter {
    fn report_devices<'a>(&'a self, device_ids: &'a [String]) -> BoxFuture<'a, Result<(), ReportError>> {
        Reporter::report_devices(self, device_ids).boxed()
    }

    fn report_shadows<'a>(&'a self, device_ids: &'a [String]) -> BoxFuture<'a, Result<(), ReportError>> {
        Reporter::report_shadows(self, device_ids).boxed()
    }

    fn report_products<'a>(
        &'a self,
        products: &'a [ProductInfo],
    ) -> BoxFuture<'a, Result<(), ReportError>> {
        Reporter::report_products(self, products).boxed()
    }

    fn collect_and_report_products(&self) -> BoxFuture<'_, Result<(), ReportError>> {
        Reporter::collect_and_report_products(self).boxed()
    }

    fn base_url(&self) -> String {
        self.credentials
            .current()
            .map(|credentials| credentials.base_url.clone())
            .unwrap_or_default()
    }

    fn token(&self) -> Option<SecretString> {
        self.credentials
            .current()
            .map(|credentials| credentials.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::registry::{MemoryRegistry, PointData};
    use crate::session::Credentials;

    type Received = Arc<Mutex<Vec<(String, String, Value)>>>;

    fn seeded_registry() -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        let mut extra = Map::new();
        extra.insert("vendor".to_string(), json!("acme"));
        registry
            .add_model(
                "modbus",
                DeviceModel {
                    name: "meter".to_string(),
                    model_id: "m-1".to_string(),
                    device_points: vec![Map::from_iter([("name".to_string(), json!("p1"))])],
                    extra,
                    ..DeviceModel::default()
                },
            )
            .expect("model");
        registry
            .add_connection("modbus", "bus-1", json!({"address": "/dev/ttyS0"}))
            .expect("connection");
        registry
            .add_or_update_device(Device {
                id: "dev1".to_string(),
                model_name: "meter".to_string(),
                description: "Main meter".to_string(),
                connection_key: "bus-1".to_string(),
                extra: Map::new(),
            })
            .expect("device");
        registry
    }

    fn reporter(registry: Arc<MemoryRegistry>, credentials: CredentialCell) -> (tempfile::TempDir, Reporter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let reporter = Reporter::new(
            Client::new(),
            "SN-1",
            credentials,
            registry.clone(),
            registry,
            ResourceLibrary::new(dir.path()),
        );
        (dir, reporter)
    }

    async fn spawn_control_plane(code: i64) -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/api/node/:sn/report/:endpoint",
                post(
                    move |State(received): State<Received>,
                          Path((sn, endpoint)): Path<(String, String)>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        received
                            .lock()
                            .expect("received lock")
                            .push((format!("{sn}/{endpoint}"), auth, body));
                        Json(json!({"success": code == 200, "code": code, "message": "done"}))
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), received)
    }

    fn signed_in(base_url: &str) -> CredentialCell {
        let cell = CredentialCell::default();
        cell.replace(Credentials {
            base_url: base_url.to_string(),
            token: SecretString::new("T1".to_string()),
        });
        cell
    }

    #[test]
    fn device_report_embeds_model_connection_and_protocol() {
        let (_dir, reporter) = reporter(seeded_registry(), CredentialCell::default());
        let reports = reporter.device_reports(&["dev1".to_string(), "ghost".to_string()]);
        assert_eq!(reports.len(), 1);

        let value = serde_json::to_value(&reports[0]).expect("serialize");
        assert_eq!(value["name"], json!("Main meter"));
        assert_eq!(value["id"], json!("dev1"));
        assert_eq!(value["connectionKey"], json!("bus-1"));
        assert_eq!(value["protocol"], json!("modbus"));
        assert_eq!(value["connections"], json!({"address": "/dev/ttyS0"}));
        assert_eq!(value["model"]["modelId"], json!("m-1"));
        assert_eq!(value["model"]["vendor"], json!("acme"));
        assert_eq!(value["model"]["devicePoints"], json!([{"name": "p1"}]));
        assert!(value["model"].get("devices").is_none());
    }

    #[test]
    fn shadow_reports_skip_missing_devices() {
        let registry = seeded_registry();
        registry
            .write_points(
                "dev1",
                vec![PointData {
                    point_name: "p1".to_string(),
                    value: json!(7),
                }],
            )
            .expect("write");
        let (_dir, reporter) = reporter(registry, CredentialCell::default());
        let shadows = reporter.shadow_reports(&["dev1".to_string(), "dev2".to_string()]);
        assert_eq!(shadows.len(), 1);
        assert_eq!(shadows[0].points.get("p1"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn reports_fail_before_login() {
        let (_dir, reporter) = reporter(seeded_registry(), CredentialCell::default());
        assert!(!reporter.is_ready());
        assert!(matches!(
            reporter.report_devices(&["dev1".to_string()]).await,
            Err(ReportError::NotReady)
        ));
        assert_eq!(RpcContext::base_url(&reporter), "");
        assert!(RpcContext::token(&reporter).is_none());
    }

    #[tokio::test]
    async fn report_posts_with_bearer_token() {
        let (base_url, received) = spawn_control_plane(200).await;
        let (_dir, reporter) = reporter(seeded_registry(), signed_in(&base_url));

        reporter
            .report_devices(&["dev1".to_string()])
            .await
            .expect("report devices");
        reporter.report_metadata().await.expect("report metadata");

        let received = received.lock().expect("received lock").clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, "SN-1/devices");
        assert_eq!(received[0].1, "Bearer T1");
        assert_eq!(received[0].2[0]["id"], json!("dev1"));
        assert_eq!(received[1].0, "SN-1/metadata");
        assert_eq!(received[1].2["serialNo"], json!("SN-1"));
    }

    #[tokio::test]
    async fn empty_library_reports_empty_catalog() {
        let (base_url, received) = spawn_control_plane(200).await;
        let (_dir, reporter) = reporter(seeded_registry(), signed_in(&base_url));

        reporter
            .collect_and_report_products()
            .await
            .expect("report products");

        let received = received.lock().expect("received lock").clone();
        assert_eq!(received[0].0, "SN-1/products");
        assert_eq!(received[0].2, json!([]));
    }

    #[tokio::test]
    async fn non_ok_code_is_rejected() {
        let (base_url, _received) = spawn_control_plane(401).await;
        let (_dir, reporter) = reporter(seeded_registry(), signed_in(&base_url));

        let err = reporter
            .report_shadows(&["dev1".to_string()])
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            ReportError::Rejected { endpoint, code: 401, .. } if endpoint == SHADOWS_ENDPOINT
        ));
    }
}
