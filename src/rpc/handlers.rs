use std::collections::BTreeMap;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::library::ResourceLibrary;
use crate::registry::{Device, DeviceModel, PointData};
use crate::rpc::context::HandlerContext;
use crate::rpc::dispatcher::{Handler, HandlerError, HandlerFuture};
use crate::rpc::product_import::handle_product_import;

/// Every inbound method the agent understands.
pub const STANDARD_HANDLERS: &[(&str, Handler)] = &[
    ("node.networkStatus", handle_network_status as Handler),
    ("node.configChanged", handle_config_changed as Handler),
    ("node.command", handle_command as Handler),
    ("device.control", handle_device_control as Handler),
    ("devices.add", handle_devices_add as Handler),
    ("devices.delete", handle_devices_delete as Handler),
    ("devices.report", handle_devices_report as Handler),
    ("product.import", handle_product_import as Handler),
    ("products.report", handle_products_report as Handler),
];

pub(crate) fn decode<T: DeserializeOwned>(params: Value) -> Result<T, HandlerError> {
    serde_json::from_value(params).map_err(HandlerError::InvalidParams)
}

#[derive(Debug, Deserialize)]
struct NetworkStatus {
    #[serde(default)]
    networked: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceControl {
    id: String,
    #[serde(default)]
    points: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevicesAdd {
    #[serde(default)]
    plugin: String,
    #[serde(default)]
    model_key: String,
    #[serde(default)]
    model_hash: String,
    #[serde(default)]
    connection_key: String,
    #[serde(default)]
    connection: Value,
    #[serde(default)]
    devices: Vec<Device>,
    /// Inline model definition used by older servers instead of a library key.
    #[serde(default)]
    model: Option<DeviceModel>,
}

/// Reports devices then shadows, logging failures of either.
async fn report_devices_and_shadows(cx: &HandlerContext, ids: &[String]) {
    if let Err(err) = cx.rpc().report_devices(ids).await {
        error!(event = "report_devices_failed", devices = ids.len(), error = %err);
    }
    if let Err(err) = cx.rpc().report_shadows(ids).await {
        error!(event = "report_shadows_failed", devices = ids.len(), error = %err);
    }
}

fn handle_network_status<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        let status: NetworkStatus = decode(params)?;
        info!(event = "network_status", networked = status.networked);
        if !status.networked {
            return Ok(());
        }

        let ids = cx.registry().device_ids();
        report_devices_and_shadows(cx, &ids).await;
        cx.rpc().collect_and_report_products().await?;
        Ok(())
    }
    .boxed()
}

fn handle_config_changed<'a>(_cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        info!(event = "config_changed", params = %params);
        Ok(())
    }
    .boxed()
}

fn handle_command<'a>(_cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        info!(event = "node_command", params = %params);
        Ok(())
    }
    .boxed()
}

fn handle_device_control<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        let control: DeviceControl = decode(params)?;
        let points = control
            .points
            .into_iter()
            .map(|(point_name, value)| PointData { point_name, value })
            .collect::<Vec<_>>();
        info!(event = "device_control", device = %control.id, points = points.len());
        cx.registry().write_points(&control.id, points)?;
        Ok(())
    }
    .boxed()
}

fn handle_devices_add<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        let add: DevicesAdd = decode(params)?;
        let registry = cx.registry();

        let model = match add.model {
            Some(model) => model,
            None => load_verified_model(cx.library(), &add.model_key, &add.model_hash)?,
        };
        let mut ids: Vec<String> = model.devices.iter().map(|device| device.id.clone()).collect();
        registry.add_model(&add.plugin, model)?;

        registry.add_connection(&add.plugin, &add.connection_key, add.connection)?;

        for device in add.devices {
            let id = device.id.clone();
            match registry.add_or_update_device(device) {
                Ok(()) => ids.push(id),
                Err(err) => error!(event = "device_add_failed", device = %id, error = %err),
            }
        }

        info!(event = "devices_added", plugin = %add.plugin, devices = ids.len());
        if let Err(err) = cx.rpc().report_devices(&ids).await {
            error!(event = "report_devices_failed", devices = ids.len(), error = %err);
        }
        Ok(())
    }
    .boxed()
}

/// Loads `model/{key}.json` and checks it against the hash the server sent.
///
/// The registered model is named `{key}_{hash}`.
fn load_verified_model(
    library: &ResourceLibrary,
    key: &str,
    expected: &str,
) -> Result<DeviceModel, HandlerError> {
    let (content, computed) = library.read_model(key)?;
    if computed != expected {
        return Err(HandlerError::HashMismatch {
            key: key.to_string(),
            expected: expected.to_string(),
            computed,
        });
    }
    let mut model = ResourceLibrary::parse_model(key, &content)?;
    model.name = format!("{key}_{computed}");
    Ok(model)
}

fn handle_devices_delete<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        let ids: Vec<String> = decode(params)?;
        cx.registry().remove_devices(&ids)?;
        cx.registry().reload_plugins();
        info!(event = "devices_deleted", devices = ids.len());
        Ok(())
    }
    .boxed()
}

fn handle_devices_report<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        let ids = match params {
            Value::Null => cx.registry().device_ids(),
            other => decode::<Vec<String>>(other)?,
        };
        if ids.is_empty() {
            warn!(event = "devices_report_empty");
        }
        report_devices_and_shadows(cx, &ids).await;
        Ok(())
    }
    .boxed()
}

fn handle_products_report<'a>(cx: &'a HandlerContext, _params: Value) -> HandlerFuture<'a> {
    async move {
        cx.rpc().collect_and_report_products().await?;
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::library::content_hash;
    use crate::registry::{DeviceRegistry, ShadowStore};
    use crate::rpc::context::testing::{fixture, fixture_with, Call, Fixture, RecordingContext};

    fn find(method: &str) -> Handler {
        STANDARD_HANDLERS
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, handler)| *handler)
            .expect("registered handler")
    }

    fn seed_device(fx: &Fixture, id: &str) {
        fx.registry
            .add_model(
                "modbus",
                DeviceModel {
                    name: "meter".to_string(),
                    ..DeviceModel::default()
                },
            )
            .expect("model");
        fx.registry
            .add_or_update_device(Device {
                id: id.to_string(),
                model_name: "meter".to_string(),
                ..Device::default()
            })
            .expect("device");
    }

    #[tokio::test]
    async fn network_status_reports_everything_when_networked() {
        let fx = fixture();
        seed_device(&fx, "dev1");

        find("node.networkStatus")(&fx.handler, json!({"networked": true}))
            .await
            .expect("network status");

        let ids = vec!["dev1".to_string()];
        assert_eq!(
            fx.context.calls(),
            vec![Call::Devices(ids.clone()), Call::Shadows(ids), Call::CollectProducts]
        );
    }

    #[tokio::test]
    async fn network_status_offline_reports_nothing() {
        let fx = fixture();
        find("node.networkStatus")(&fx.handler, json!({"networked": false}))
            .await
            .expect("network status");
        assert!(fx.context.calls().is_empty());
    }

    #[tokio::test]
    async fn network_status_returns_product_report_failure() {
        let fx = fixture_with(RecordingContext {
            fail_products: true,
            ..RecordingContext::default()
        });
        let result = find("node.networkStatus")(&fx.handler, json!({"networked": true})).await;
        assert!(matches!(result, Err(HandlerError::Report(_))));
    }

    #[tokio::test]
    async fn device_control_writes_points() {
        let fx = fixture();
        seed_device(&fx, "dev1");

        find("device.control")(&fx.handler, json!({"id": "dev1", "points": {"p1": "5"}}))
            .await
            .expect("device control");

        let shadow = fx.registry.shadow("dev1").expect("shadow");
        assert_eq!(shadow.points.get("p1"), Some(&json!("5")));
    }

    #[tokio::test]
    async fn device_control_requires_an_id() {
        let fx = fixture();
        let result = find("device.control")(&fx.handler, json!({"points": {}})).await;
        assert!(matches!(result, Err(HandlerError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn devices_add_verifies_library_model_hash() {
        let fx = fixture();
        let model_json = r#"{"name":"m1","devicePoints":[{"name":"p1"}]}"#;
        fx.handler
            .library()
            .save_model("meter:m1", model_json)
            .expect("save model");
        let hash = content_hash(model_json.as_bytes());
        let model_name = format!("meter:m1_{hash}");

        find("devices.add")(
            &fx.handler,
            json!({
                "plugin": "modbus",
                "modelKey": "meter:m1",
                "modelHash": hash,
                "connectionKey": "bus-1",
                "connection": {"address": "/dev/ttyS0"},
                "devices": [
                    {"id": "dev1", "modelName": model_name, "connectionKey": "bus-1"},
                    {"id": "dev2", "modelName": "unknown"}
                ]
            }),
        )
        .await
        .expect("devices add");

        let model = fx.registry.model(&model_name).expect("model registered");
        assert_eq!(model.device_points.len(), 1);
        assert_eq!(fx.registry.connection_plugin("bus-1").as_deref(), Some("modbus"));
        assert!(fx.registry.device("dev1").is_some());
        assert!(fx.registry.device("dev2").is_none());
        assert_eq!(fx.context.calls(), vec![Call::Devices(vec!["dev1".to_string()])]);
    }

    #[tokio::test]
    async fn devices_add_rejects_hash_mismatch() {
        let fx = fixture();
        fx.handler
            .library()
            .save_model("meter:m1", "{\"name\":\"m1\"}")
            .expect("save model");

        let result = find("devices.add")(
            &fx.handler,
            json!({"plugin": "modbus", "modelKey": "meter:m1", "modelHash": "0000"}),
        )
        .await;

        assert!(matches!(result, Err(HandlerError::HashMismatch { expected, .. }) if expected == "0000"));
        assert!(fx.registry.devices().is_empty());
        assert!(fx.context.calls().is_empty());
    }

    #[tokio::test]
    async fn devices_add_accepts_inline_model() {
        let fx = fixture();
        find("devices.add")(
            &fx.handler,
            json!({
                "plugin": "bacnet",
                "connectionKey": "bus-2",
                "model": {"name": "valve", "devices": [{"id": "v1", "modelName": "valve"}]}
            }),
        )
        .await
        .expect("devices add");

        assert_eq!(fx.registry.connection_plugin("bus-2").as_deref(), Some("bacnet"));
        assert!(fx.registry.model("valve").is_some());
        assert!(fx.registry.device("v1").is_some());
        assert_eq!(fx.context.calls(), vec![Call::Devices(vec!["v1".to_string()])]);
    }

    #[tokio::test]
    async fn devices_add_fails_when_connection_is_rejected() {
        let fx = fixture();
        let result = find("devices.add")(
            &fx.handler,
            json!({
                "plugin": "bacnet",
                "model": {"name": "valve"},
                "devices": [{"id": "v1", "modelName": "valve"}]
            }),
        )
        .await;

        assert!(matches!(result, Err(HandlerError::Registry(_))));
        assert!(fx.registry.device("v1").is_none());
        assert!(fx.context.calls().is_empty());
    }

    #[tokio::test]
    async fn devices_delete_removes_and_reloads() {
        let fx = fixture();
        seed_device(&fx, "dev1");
        seed_device(&fx, "dev2");

        find("devices.delete")(&fx.handler, json!(["dev1"]))
            .await
            .expect("devices delete");

        assert_eq!(fx.registry.device_ids(), vec!["dev2".to_string()]);
        assert_eq!(fx.registry.reload_count(), 1);
    }

    #[tokio::test]
    async fn devices_report_null_means_all_devices() {
        let fx = fixture();
        seed_device(&fx, "dev1");
        seed_device(&fx, "dev2");

        find("devices.report")(&fx.handler, Value::Null)
            .await
            .expect("devices report");

        let ids = vec!["dev1".to_string(), "dev2".to_string()];
        assert_eq!(fx.context.calls(), vec![Call::Devices(ids.clone()), Call::Shadows(ids)]);
    }

    #[tokio::test]
    async fn devices_report_subset_and_malformed_params() {
        let fx = fixture();
        seed_device(&fx, "dev1");

        find("devices.report")(&fx.handler, json!(["dev9"]))
            .await
            .expect("devices report");
        let ids = vec!["dev9".to_string()];
        assert_eq!(fx.context.calls(), vec![Call::Devices(ids.clone()), Call::Shadows(ids)]);

        let result = find("devices.report")(&fx.handler, json!({"ids": ["dev1"]})).await;
        assert!(matches!(result, Err(HandlerError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn products_report_collects_catalog() {
        let fx = fixture();
        find("products.report")(&fx.handler, Value::Null)
            .await
            .expect("products report");
        assert_eq!(fx.context.calls(), vec![Call::CollectProducts]);
    }

    #[tokio::test]
    async fn informational_methods_only_log() {
        let fx = fixture();
        find("node.configChanged")(&fx.handler, json!({"interval": 5}))
            .await
            .expect("config changed");
        find("node.command")(&fx.handler, json!("restart"))
            .await
            .expect("command");
        assert!(fx.context.calls().is_empty());
    }
}
