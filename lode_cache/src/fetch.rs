use crate::error::ResourceError;
use base64::Engine;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Describes where the underlying bytes are located.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataLocation {
    Url(String),
    File(PathBuf),
    Blob(Bytes),
}

impl DataLocation {
    /// Stable identity string used to build cache keys. Blobs have no URI, so
    /// their identity is derived from the content itself; two blobs collide
    /// only when their bytes match.
    pub fn identity(&self) -> String {
        match self {
            DataLocation::Url(url) => url.clone(),
            DataLocation::File(path) => path.to_string_lossy().into_owned(),
            DataLocation::Blob(bytes) => {
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                format!("blob:{}:{:016x}", bytes.len(), hasher.finish())
            }
        }
    }

    /// Resolve a glTF-relative URI against this location.
    ///
    /// Data URIs decode to an immediate [`DataLocation::Blob`]; absolute http
    /// URIs pass through; everything else resolves as a sibling of `self`.
    pub fn resolve_relative(&self, uri: &str) -> Result<DataLocation, ResourceError> {
        if uri.starts_with("data:") {
            return Ok(DataLocation::Blob(decode_data_uri(uri)?));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(DataLocation::Url(uri.to_owned()));
        }
        match self {
            DataLocation::Url(base) => {
                let split = base.rfind('/').map(|idx| idx + 1).unwrap_or(base.len());
                Ok(DataLocation::Url(format!("{}{}", &base[..split], uri)))
            }
            DataLocation::File(base) => {
                let mut resolved = base.parent().map(PathBuf::from).unwrap_or_default();
                resolved.push(uri);
                Ok(DataLocation::File(resolved))
            }
            DataLocation::Blob(_) => Err(ResourceError::format(
                "Failed to resolve URI",
                format!("cannot resolve {uri} relative to an in-memory blob"),
            )),
        }
    }
}

/// Decode a `data:[<mediatype>][;base64],<data>` URI into raw bytes.
pub fn decode_data_uri(uri: &str) -> Result<Bytes, ResourceError> {
    let comma = uri.find(',').ok_or_else(|| {
        ResourceError::format("Failed to decode data URI", "missing comma separator")
    })?;
    let header = &uri["data:".len()..comma];
    let payload = &uri[comma + 1..];
    if header.ends_with(";base64") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ResourceError::format("Failed to decode data URI", e))?;
        Ok(Bytes::from(decoded))
    } else {
        Ok(Bytes::copy_from_slice(payload.as_bytes()))
    }
}

/// Extract the media type from a data URI, e.g. `image/ktx`.
pub fn data_uri_media_type(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("data:")?;
    let end = rest.find([';', ','])?;
    Some(&rest[..end]).filter(|media| !media.is_empty())
}

/// Byte source for the loader pipeline.
///
/// Kept object-safe so a cache session can swap the transport out wholesale
/// (disk, network, or preloaded memory in tests).
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        location: &'a DataLocation,
    ) -> BoxFuture<'a, Result<Bytes, ResourceError>>;
}

/// Disk + HTTP fetcher, the default transport for a renderer session.
#[derive(Debug, Default)]
pub struct StandardFetcher {
    client: reqwest::Client,
}

impl StandardFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fetcher for StandardFetcher {
    fn fetch<'a>(
        &'a self,
        location: &'a DataLocation,
    ) -> BoxFuture<'a, Result<Bytes, ResourceError>> {
        Box::pin(async move {
            match location {
                DataLocation::Blob(bytes) => Ok(bytes.clone()),
                DataLocation::File(path) => tokio::fs::read(path)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| ResourceError::fetch(path.to_string_lossy(), e)),
                DataLocation::Url(url) => {
                    let response = self
                        .client
                        .get(url.as_str())
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| ResourceError::fetch(url, e))?;
                    response
                        .bytes()
                        .await
                        .map_err(|e| ResourceError::fetch(url, e))
                }
            }
        })
    }
}

/// Preloaded in-memory fetcher keyed by [`DataLocation::identity`], used by
/// tests and by embedders that stage their own bytes.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    entries: HashMap<String, Bytes>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: impl Into<String>, bytes: impl Into<Bytes>) {
        self.entries.insert(identity.into(), bytes.into());
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch<'a>(
        &'a self,
        location: &'a DataLocation,
    ) -> BoxFuture<'a, Result<Bytes, ResourceError>> {
        Box::pin(async move {
            if let DataLocation::Blob(bytes) = location {
                return Ok(bytes.clone());
            }
            let identity = location.identity();
            self.entries
                .get(&identity)
                .cloned()
                .ok_or_else(|| ResourceError::fetch(identity, "not present in memory fetcher"))
        })
    }
}
