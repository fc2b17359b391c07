use crate::buffer::BufferLoader;
use crate::cache_ext::GltfCacheExt;
use bytes::Bytes;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::fetch::{decode_data_uri, DataLocation, Fetcher};
use lode_cache::frame::FrameContext;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

/// Parsed glTF document plus strong references to every buffer it declares.
///
/// `root` is the raw json tree, kept alongside the typed `document` so
/// extension payloads the `gltf` crate does not model stay reachable.
pub struct GltfDocument {
    pub document: gltf::Document,
    pub root: gltf::json::Root,
    pub identity: String,
    pub location: DataLocation,
    buffers: Vec<ResourceHandle<BufferLoader>>,
}

impl GltfDocument {
    /// Loaded bytes of buffer `index`, zero-copy.
    pub fn buffer_bytes(&self, index: usize) -> Option<Bytes> {
        self.buffers.get(index).and_then(|buffer| buffer.bytes())
    }

    pub fn buffer_handle(&self, index: usize) -> Option<&ResourceHandle<BufferLoader>> {
        self.buffers.get(index)
    }

    /// Raw extension object on the document root, by name.
    pub fn root_extension(&self, name: &str) -> Option<&serde_json::Value> {
        self.root
            .extensions
            .as_ref()
            .and_then(|ext| ext.others.get(name))
    }
}

struct Parsed {
    document: gltf::Document,
    root: gltf::json::Root,
    blob: Option<Bytes>,
}

enum Stage {
    Fetching,
    Parsed(Parsed),
    AwaitingBuffers {
        document: gltf::Document,
        root: gltf::json::Root,
        buffers: Vec<ResourceHandle<BufferLoader>>,
    },
    Done,
}

struct Inner {
    stage: Stage,
    document: Option<Arc<GltfDocument>>,
}

/// Fetches and parses a glTF or GLB document, then preloads every buffer it
/// declares through the cache. `Ready` only once all buffer loads settle.
pub struct GltfJsonLoader {
    core: LoaderCore,
    location: DataLocation,
    identity: String,
    fetcher: Arc<dyn Fetcher>,
    keep_resident: bool,
    inner: Mutex<Inner>,
}

impl GltfJsonLoader {
    pub fn new(
        key: CacheKey,
        location: DataLocation,
        fetcher: Arc<dyn Fetcher>,
        keep_resident: bool,
    ) -> Arc<Self> {
        let identity = location.identity();
        Arc::new(Self {
            core: LoaderCore::new(key),
            location,
            identity,
            fetcher,
            keep_resident,
            inner: Mutex::new(Inner {
                stage: Stage::Fetching,
                document: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The assembled document, available once `Ready`.
    pub fn document(&self) -> Option<Arc<GltfDocument>> {
        self.inner().document.clone()
    }

    fn fail(&self, error: ResourceError) {
        {
            let mut inner = self.inner();
            inner.stage = Stage::Done;
            inner.document = None;
        }
        self.core.fail(ResourceError::dependency(
            format!("Failed to load glTF: {}", self.identity),
            error,
        ));
    }

    /// One cache request per declared buffer. Data URIs and the GLB blob are
    /// registered as immediately-ready embedded buffers.
    fn issue_buffer_loads(
        &self,
        frame: &mut FrameContext<'_>,
        parsed: &Parsed,
    ) -> Result<Vec<ResourceHandle<BufferLoader>>, ResourceError> {
        let mut buffers = Vec::with_capacity(parsed.document.buffers().len());
        for buffer in parsed.document.buffers() {
            let declared = buffer.length();
            let handle = match buffer.source() {
                gltf::buffer::Source::Bin => {
                    let blob = parsed.blob.clone().ok_or_else(|| {
                        ResourceError::format(
                            self.identity.clone(),
                            "document references a binary chunk but has none",
                        )
                    })?;
                    if blob.len() < declared {
                        return Err(ResourceError::format(
                            self.identity.clone(),
                            format!(
                                "binary chunk holds {} bytes, buffer declares {declared}",
                                blob.len()
                            ),
                        ));
                    }
                    frame.cache.load_embedded_buffer(
                        &self.identity,
                        buffer.index(),
                        blob.slice(..declared),
                        self.keep_resident,
                    )?
                }
                gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => {
                    let decoded = decode_data_uri(uri)?;
                    if decoded.len() < declared {
                        return Err(ResourceError::format(
                            self.identity.clone(),
                            format!(
                                "data uri holds {} bytes, buffer declares {declared}",
                                decoded.len()
                            ),
                        ));
                    }
                    frame.cache.load_embedded_buffer(
                        &self.identity,
                        buffer.index(),
                        decoded,
                        self.keep_resident,
                    )?
                }
                gltf::buffer::Source::Uri(uri) => {
                    let location = self.location.resolve_relative(uri)?;
                    frame
                        .cache
                        .load_external_buffer(location, self.keep_resident)?
                }
            };
            buffers.push(handle);
        }
        Ok(buffers)
    }

    fn check_buffer_lengths(
        &self,
        document: &gltf::Document,
        buffers: &[ResourceHandle<BufferLoader>],
    ) -> Result<(), ResourceError> {
        for (buffer, handle) in document.buffers().zip(buffers) {
            let loaded = handle.bytes().map(|b| b.len()).unwrap_or(0);
            if loaded < buffer.length() {
                return Err(ResourceError::format(
                    self.identity.clone(),
                    format!(
                        "buffer {} holds {loaded} bytes, declares {}",
                        buffer.index(),
                        buffer.length()
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl ResourceLoader for GltfJsonLoader {
    fn cache_key(&self) -> &CacheKey {
        self.core.cache_key()
    }

    fn state(&self) -> ResourceLoaderState {
        self.core.state()
    }

    fn signal(&self) -> LoadSignal {
        self.core.signal()
    }

    fn load(self: Arc<Self>) {
        if !self.core.begin_loading() {
            return;
        }
        let loader = self.clone();
        tokio::spawn(async move {
            let fetched = loader.fetcher.fetch(&loader.location).await;
            let bytes = match fetched {
                Ok(bytes) => bytes,
                Err(error) => {
                    if !loader.core.is_destroyed() {
                        loader.fail(error);
                    }
                    return;
                }
            };
            let is_glb = bytes.len() >= 4 && &bytes[0..4] == b"glTF";
            tracing::debug!(
                identity = %loader.identity,
                container = if is_glb { "glb" } else { "json" },
                "parsing glTF document"
            );
            let parsed = tokio::task::spawn_blocking(move || {
                gltf::Gltf::from_slice(&bytes).map(|gltf| Parsed {
                    root: gltf.document.clone().into_json(),
                    document: gltf.document,
                    blob: gltf.blob.map(Bytes::from),
                })
            })
            .await;
            let mut inner = loader.inner();
            if loader.core.is_destroyed() {
                return;
            }
            match parsed {
                Ok(Ok(parsed)) => {
                    inner.stage = Stage::Parsed(parsed);
                    drop(inner);
                    loader.core.begin_processing();
                }
                Ok(Err(error)) => {
                    drop(inner);
                    loader.fail(ResourceError::format(loader.identity.clone(), error));
                }
                Err(join_error) => {
                    drop(inner);
                    loader.fail(ResourceError::decode(loader.identity.clone(), join_error));
                }
            }
        });
    }

    fn update(&self, frame: &mut FrameContext<'_>) {
        if self.state() != ResourceLoaderState::Processing {
            return;
        }
        let mut inner = self.inner();
        match std::mem::replace(&mut inner.stage, Stage::Done) {
            Stage::Fetching => inner.stage = Stage::Fetching,
            Stage::Done => {}
            Stage::Parsed(parsed) => {
                drop(inner);
                match self.issue_buffer_loads(frame, &parsed) {
                    Ok(buffers) => {
                        let mut inner = self.inner();
                        if self.core.is_destroyed() {
                            return;
                        }
                        inner.stage = Stage::AwaitingBuffers {
                            document: parsed.document,
                            root: parsed.root,
                            buffers,
                        };
                        drop(inner);
                        // embedded-only documents can finish this same frame
                        self.update(frame);
                    }
                    Err(error) => self.fail(error),
                }
            }
            Stage::AwaitingBuffers {
                document,
                root,
                buffers,
            } => {
                let mut failed = None;
                let mut pending = false;
                for buffer in &buffers {
                    match buffer.signal().try_result() {
                        None => pending = true,
                        Some(Err(error)) => {
                            failed = Some(error);
                            break;
                        }
                        Some(Ok(())) => {}
                    }
                }
                if let Some(error) = failed {
                    drop(inner);
                    drop(buffers);
                    self.fail(error);
                    return;
                }
                if pending {
                    inner.stage = Stage::AwaitingBuffers {
                        document,
                        root,
                        buffers,
                    };
                    return;
                }
                if let Err(error) = self.check_buffer_lengths(&document, &buffers) {
                    drop(inner);
                    drop(buffers);
                    self.fail(error);
                    return;
                }
                inner.document = Some(Arc::new(GltfDocument {
                    document,
                    root,
                    identity: self.identity.clone(),
                    location: self.location.clone(),
                    buffers,
                }));
                drop(inner);
                self.core.finish();
            }
        }
    }

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.stage = Stage::Done;
            inner.document = None;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
