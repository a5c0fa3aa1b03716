//! `product.import`: download resource bundles into the local library.
//!
//! Each param is a server-relative path. The response is a `RestResult` whose
//! data carries one protocol script plus any number of model/driver pairs.

use futures_util::FutureExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::library::{LibraryError, ResourceLibrary};
use crate::rest::{summarize_error_body, RestResult};
use crate::rpc::context::HandlerContext;
use crate::rpc::dispatcher::{HandlerError, HandlerFuture};
use crate::rpc::handlers::decode;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no credentials available for resource download")]
    NotReady,

    #[error("resource request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("unexpected content type '{0}'")]
    ContentType(String),

    #[error("failed to parse resource response: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("resource download rejected with code {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error(transparent)]
    Library(#[from] LibraryError),
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBundle {
    #[serde(default)]
    pub protocol_key: String,
    #[serde(default)]
    pub lua: String,
    #[serde(default)]
    pub models: Vec<ModelResource>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ModelResource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub lua: String,
}

impl ResourceBundle {
    /// Writes the bundle into `library` and returns the number of files written.
    ///
    /// Entries with an empty name are skipped, as are empty model or driver
    /// bodies.
    pub fn save(&self, library: &ResourceLibrary) -> Result<usize, LibraryError> {
        let mut written = 0;
        if !self.protocol_key.is_empty() {
            library.save_protocol(&self.protocol_key, &self.lua)?;
            written += 1;
        }

        for resource in &self.models {
            if resource.name.is_empty() {
                warn!(event = "import_resource_unnamed");
                continue;
            }
            if !resource.model.is_empty() {
                library.save_model(&resource.name, &resource.model)?;
                written += 1;
            }
            if !resource.lua.is_empty() {
                library.save_driver(&resource.name, &resource.lua)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

pub(crate) fn handle_product_import<'a>(cx: &'a HandlerContext, params: Value) -> HandlerFuture<'a> {
    async move {
        if params.is_null() {
            return Err(HandlerError::MissingParams);
        }
        let paths: Vec<String> = decode(params)?;

        for path in &paths {
            let bundle = fetch_bundle(cx, path).await?;
            let written = bundle.save(cx.library()).map_err(ImportError::from)?;
            info!(event = "import_resource_saved", path = %path, files = written);
        }

        info!(event = "import_completed", resources = paths.len());
        cx.rpc().collect_and_report_products().await?;
        Ok(())
    }
    .boxed()
}

async fn fetch_bundle(cx: &HandlerContext, path: &str) -> Result<ResourceBundle, ImportError> {
    let token = cx.rpc().token().ok_or(ImportError::NotReady)?;
    let url = format!("{}{}", cx.rpc().base_url(), path);

    let response = cx
        .http()
        .get(&url)
        .bearer_auth(token.expose_secret())
        .send()
        .await
        .map_err(ImportError::Transport)?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.text().await.map_err(ImportError::Transport)?;

    if !status.is_success() {
        return Err(ImportError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    if !content_type.contains("application/json") {
        return Err(ImportError::ContentType(content_type));
    }

    parse_bundle(&body)
}

fn parse_bundle(body: &str) -> Result<ResourceBundle, ImportError> {
    let result = RestResult::from_text(body).map_err(ImportError::Parse)?;
    if !result.is_ok() {
        return Err(ImportError::Rejected {
            code: result.code,
            message: result.message,
        });
    }
    serde_json::from_value(result.data).map_err(ImportError::Parse)
}
