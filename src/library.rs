//! Local resource library.
//!
//! Layout under the resource root:
//!
//! ```text
//! library/model/{product}:{model}.json
//! library/driver/{product}:{driver}.lua
//! library/protocol/{protocol}.lua
//! ```
//!
//! File contents are identified by lowercase hex MD5, which is what the
//! control plane compares against.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::registry::DeviceModel;

const MODEL_DIR: &str = "model";
const DRIVER_DIR: &str = "driver";
const PROTOCOL_DIR: &str = "protocol";

/// One product in the reported catalog.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductInfo {
    pub product: String,
    pub hash: String,
    /// Model key -> file hash.
    pub models: BTreeMap<String, String>,
    /// Driver key -> file hash.
    pub driver: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid resource name '{0}'")]
    InvalidName(String),

    #[error("failed to parse model {key}: {source}")]
    Model {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug)]
pub struct ResourceLibrary {
    root: PathBuf,
}

impl ResourceLibrary {
    /// `resource_path` is the resource root; the library lives in its
    /// `library/` subdirectory.
    pub fn new(resource_path: impl Into<PathBuf>) -> Self {
        Self {
            root: resource_path.into().join("library"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_path(&self, key: &str) -> Result<PathBuf, LibraryError> {
        self.resource_path(MODEL_DIR, key, "json")
    }

    /// Reads a model file and returns its bytes with their hash.
    pub fn read_model(&self, key: &str) -> Result<(Vec<u8>, String), LibraryError> {
        let path = self.model_path(key)?;
        let content = fs::read(&path).map_err(|source| LibraryError::Io { path, source })?;
        let hash = content_hash(&content);
        Ok((content, hash))
    }

    pub fn parse_model(key: &str, content: &[u8]) -> Result<DeviceModel, LibraryError> {
        serde_json::from_slice(content).map_err(|source| LibraryError::Model {
            key: key.to_string(),
            source,
        })
    }

    pub fn save_model(&self, name: &str, content: &str) -> Result<PathBuf, LibraryError> {
        self.save(MODEL_DIR, name, "json", content)
    }

    pub fn save_driver(&self, name: &str, content: &str) -> Result<PathBuf, LibraryError> {
        self.save(DRIVER_DIR, name, "lua", content)
    }

    pub fn save_protocol(&self, key: &str, content: &str) -> Result<PathBuf, LibraryError> {
        self.save(PROTOCOL_DIR, key, "lua", content)
    }

    /// Builds the product catalog from model and driver files.
    ///
    /// A missing library directory yields an empty catalog. Products are
    /// returned sorted by id.
    pub fn collect_products(&self) -> Result<Vec<ProductInfo>, LibraryError> {
        let mut products: BTreeMap<String, ProductInfo> = BTreeMap::new();

        for (path, product, model) in self.scan(MODEL_DIR, "json")? {
            match file_hash(&path) {
                Ok(hash) => {
                    entry(&mut products, &product).models.insert(model, hash);
                }
                Err(err) => warn!(event = "library_hash_failed", path = %path.display(), error = %err),
            }
        }

        for (path, product, driver) in self.scan(DRIVER_DIR, "lua")? {
            match file_hash(&path) {
                Ok(hash) => {
                    entry(&mut products, &product).driver.insert(driver, hash);
                }
                Err(err) => warn!(event = "library_hash_failed", path = %path.display(), error = %err),
            }
        }

        Ok(products
            .into_values()
            .map(|mut product| {
                product.hash = product_hash(&product);
                product
            })
            .collect())
    }

    fn resource_path(&self, dir: &str, name: &str, ext: &str) -> Result<PathBuf, LibraryError> {
        validate_name(name)?;
        Ok(self.root.join(dir).join(format!("{name}.{ext}")))
    }

    fn save(&self, dir: &str, name: &str, ext: &str, content: &str) -> Result<PathBuf, LibraryError> {
        let path = self.resource_path(dir, name, ext)?;
        let parent = self.root.join(dir);
        fs::create_dir_all(&parent).map_err(|source| LibraryError::Io {
            path: parent,
            source,
        })?;
        fs::write(&path, content).map_err(|source| LibraryError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Returns `(path, product, member)` for every parseable file.
    fn scan(&self, dir: &str, ext: &str) -> Result<Vec<(PathBuf, String, String)>, LibraryError> {
        let base = self.root.join(dir);
        let mut files = Vec::new();
        if base.is_dir() {
            walk(&base, ext, &mut files)?;
        }
        files.sort();
        Ok(files
            .into_iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                let (product, member) = split_product_id(stem)?;
                Some((path.clone(), product.to_string(), member.to_string()))
            })
            .collect())
    }
}

/// Lowercase hex MD5 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Md5::digest(content))
}

/// Splits `product:member` into its two parts.
///
/// Anything but exactly two `:`-separated parts is rejected.
pub fn split_product_id(stem: &str) -> Option<(&str, &str)> {
    let mut parts = stem.split(':');
    let product = parts.next()?;
    let member = parts.next()?;
    if parts.next().is_some() || product.is_empty() {
        return None;
    }
    Some((product, member))
}

fn product_hash(product: &ProductInfo) -> String {
    let mut hashes: Vec<&str> = product
        .models
        .values()
        .chain(product.driver.values())
        .map(String::as_str)
        .collect();
    hashes.sort_unstable();
    content_hash(hashes.concat().as_bytes())
}

fn entry<'a>(products: &'a mut BTreeMap<String, ProductInfo>, id: &str) -> &'a mut ProductInfo {
    products.entry(id.to_string()).or_insert_with(|| ProductInfo {
        product: id.to_string(),
        ..ProductInfo::default()
    })
}

fn file_hash(path: &Path) -> io::Result<String> {
    fs::read(path).map(|content| content_hash(&content))
}

fn walk(dir: &Path, ext: &str, out: &mut Vec<PathBuf>) -> Result<(), LibraryError> {
    let entries = fs::read_dir(dir).map_err(|source| LibraryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| LibraryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, ext, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            out.push(path);
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), LibraryError> {
    let invalid = name.is_empty()
        || name.contains(['/', '\\'])
        || name.split(':').any(|part| part == "..")
        || name == "."
        || name.starts_with("..");
    if invalid {
        return Err(LibraryError::InvalidName(name.to_string()));
    }
    Ok(())
}
