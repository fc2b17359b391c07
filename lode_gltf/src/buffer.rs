use bytes::Bytes;
use lode_cache::fetch::{DataLocation, Fetcher};
use lode_cache::frame::FrameContext;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

enum Source {
    /// Fetched from a URI or file when the load begins
    External {
        location: DataLocation,
        fetcher: Arc<dyn Fetcher>,
    },
    /// Extracted from a parent container (GLB blob, data URI) up front
    Embedded(Bytes),
}

#[derive(Default)]
struct Inner {
    bytes: Option<Bytes>,
}

/// Loads the raw byte sequence of one glTF buffer.
pub struct BufferLoader {
    core: LoaderCore,
    source: Source,
    inner: Mutex<Inner>,
}

impl BufferLoader {
    pub fn external(key: CacheKey, location: DataLocation, fetcher: Arc<dyn Fetcher>) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            source: Source::External { location, fetcher },
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn embedded(key: CacheKey, bytes: Bytes) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            source: Source::Embedded(bytes),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Raw bytes, available once `Ready`.
    pub fn bytes(&self) -> Option<Bytes> {
        self.inner().bytes.clone()
    }
}

impl ResourceLoader for BufferLoader {
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
        match &self.source {
            Source::Embedded(bytes) => {
                self.inner().bytes = Some(bytes.clone());
                self.core.finish();
            }
            Source::External { location, fetcher } => {
                let loader = self.clone();
                let location = location.clone();
                let fetcher = fetcher.clone();
                tokio::spawn(async move {
                    let fetched = fetcher.fetch(&location).await;
                    let mut inner = loader.inner();
                    if loader.core.is_destroyed() {
                        return;
                    }
                    match fetched {
                        Ok(bytes) => {
                            inner.bytes = Some(bytes);
                            drop(inner);
                            loader.core.finish();
                        }
                        Err(error) => {
                            drop(inner);
                            loader.core.fail(error);
                        }
                    }
                });
            }
        }
    }

    fn update(&self, _frame: &mut FrameContext<'_>) {}

    fn destroy(&self) {
        if self.core.destroy() {
            self.inner().bytes = None;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
