use crate::buffer_view::BufferViewLoader;
use crate::draco::DracoLoader;
use crate::format::ComponentType;
use bytes::Bytes;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::frame::FrameContext;
use lode_cache::gpu::{BufferUsage, GpuBuffer, GpuResource};
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

pub enum IndexSource {
    View(ResourceHandle<BufferViewLoader>),
    Draco(ResourceHandle<DracoLoader>),
}

impl IndexSource {
    fn signal(&self) -> LoadSignal {
        match self {
            IndexSource::View(view) => view.signal(),
            IndexSource::Draco(loader) => loader.signal(),
        }
    }
}

struct Staged {
    bytes: Bytes,
    component_type: ComponentType,
    count: usize,
}

struct Inner {
    source: Option<IndexSource>,
    staged: Option<Staged>,
    buffer: Option<GpuBuffer>,
    component_type: ComponentType,
    count: usize,
}

/// Turns a buffer view or Draco index stream into a GPU index buffer.
pub struct IndexBufferLoader {
    core: LoaderCore,
    asynchronous: bool,
    garbage: crossbeam_channel::Sender<GpuResource>,
    inner: Mutex<Inner>,
}

impl IndexBufferLoader {
    /// `component_type` and `count` come from the accessor; Draco sources
    /// override them with the decoder's output.
    pub fn new(
        key: CacheKey,
        source: IndexSource,
        component_type: ComponentType,
        count: usize,
        asynchronous: bool,
        garbage: crossbeam_channel::Sender<GpuResource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            asynchronous,
            garbage,
            inner: Mutex::new(Inner {
                source: Some(source),
                staged: None,
                buffer: None,
                component_type,
                count,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn gpu_buffer(&self) -> Option<GpuBuffer> {
        self.inner().buffer
    }

    pub fn component_type(&self) -> ComponentType {
        self.inner().component_type
    }

    pub fn count(&self) -> usize {
        self.inner().count
    }

    fn stage(&self, inner: &Inner) -> Result<Staged, ResourceError> {
        match inner.source.as_ref() {
            Some(IndexSource::View(view)) => view
                .bytes()
                .map(|bytes| Staged {
                    bytes,
                    component_type: inner.component_type,
                    count: inner.count,
                })
                .ok_or(ResourceError::Destroyed),
            Some(IndexSource::Draco(loader)) => loader
                .decoded()
                .and_then(|decoded| {
                    decoded.indices.as_ref().map(|indices| Staged {
                        bytes: indices.data.clone(),
                        component_type: indices.component_type,
                        count: indices.count,
                    })
                })
                .ok_or_else(|| {
                    ResourceError::decode(
                        "Failed to load index buffer",
                        "decoded Draco output has no index stream",
                    )
                }),
            None => Err(ResourceError::Destroyed),
        }
    }

    fn fail_and_release(&self, error: ResourceError) {
        {
            let mut inner = self.inner();
            inner.source = None;
            inner.staged = None;
        }
        self.core
            .fail(ResourceError::dependency("Failed to load index buffer", error));
    }
}

impl ResourceLoader for IndexBufferLoader {
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
        self.core.begin_loading();
    }

    fn update(&self, frame: &mut FrameContext<'_>) {
        if let Some(IndexSource::Draco(loader)) = self.inner().source.as_ref() {
            let draco = loader.loader().clone();
            draco.update(frame);
        }

        match self.state() {
            ResourceLoaderState::Loading => {
                let settled = match self.inner().source.as_ref() {
                    Some(source) => source.signal().try_result(),
                    None => return,
                };
                match settled {
                    None => {}
                    Some(Err(error)) => self.fail_and_release(error),
                    Some(Ok(())) => {
                        if !self.core.begin_processing() {
                            return;
                        }
                        let mut inner = self.inner();
                        match self.stage(&inner) {
                            Ok(staged) => {
                                inner.component_type = staged.component_type;
                                inner.count = staged.count;
                                inner.staged = Some(staged);
                            }
                            Err(error) => {
                                drop(inner);
                                self.fail_and_release(error);
                                return;
                            }
                        }
                        drop(inner);
                        if !self.asynchronous {
                            self.update(frame);
                        }
                    }
                }
            }
            ResourceLoaderState::Processing => {
                let mut inner = self.inner();
                let Some(staged) = inner.staged.take() else {
                    return;
                };
                match frame.gpu.create_buffer(BufferUsage::Index, &staged.bytes) {
                    Ok(buffer) => {
                        inner.buffer = Some(buffer);
                        inner.source = None;
                        drop(inner);
                        self.core.finish();
                    }
                    Err(error) => {
                        inner.source = None;
                        drop(inner);
                        self.core
                            .fail(ResourceError::dependency("Failed to load index buffer", error));
                    }
                }
            }
            _ => {}
        }
    }

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.source = None;
            inner.staged = None;
            if let Some(buffer) = inner.buffer.take() {
                let _ = self.garbage.send(GpuResource::Buffer(buffer));
            }
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_ext::GltfCacheExt;
    use crate::draco::tests::StubDecoder;
    use lode_cache::cache::ResourceCache;
    use lode_cache::fetch::{DataLocation, MemoryFetcher};
    use lode_cache::gpu::RecordingGpu;
    use std::collections::HashMap;

    #[tokio::test(flavor = "multi_thread")]
    async fn draco_source_overrides_accessor_index_layout() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://mesh.drc", Bytes::from_static(&[7u8; 24]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let parent = cache
            .load_external_buffer(DataLocation::Url("mem://mesh.drc".into()), false)
            .expect("parent");
        let view_key = CacheKey::buffer_view("doc", 0);
        let view = cache
            .get_or_load(view_key.clone(), false, |_| {
                Ok(BufferViewLoader::new(view_key.clone(), parent.clone(), 0, 24))
            })
            .expect("view");
        view.signal().settled().await.expect("view ready");
        cache.release(parent);

        let draco_key = CacheKey::draco("doc", 0);
        let draco = cache
            .get_or_load(draco_key.clone(), false, |_| {
                Ok(DracoLoader::new(
                    draco_key.clone(),
                    view,
                    Arc::new(StubDecoder),
                    HashMap::new(),
                ))
            })
            .expect("draco");
        draco.loader().clone().load();

        // accessor said U32, the decoder emits U16
        let loader = IndexBufferLoader::new(
            CacheKey::index_buffer_draco("doc", 0),
            IndexSource::Draco(draco),
            ComponentType::U32,
            0,
            false,
            garbage,
        );
        loader.clone().load();

        let mut frame_number = 1;
        while loader.state().is_active() {
            let mut frame = FrameContext::new(&mut cache, &mut gpu, frame_number);
            loader.update(&mut frame);
            frame_number += 1;
            tokio::task::yield_now().await;
        }
        assert_eq!(loader.state(), ResourceLoaderState::Ready);
        assert_eq!(loader.component_type(), ComponentType::U16);
        assert_eq!(loader.count(), 3);
        assert_eq!(gpu.buffers_created, vec![(BufferUsage::Index, 6)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn view_failure_propagates_as_dependency_error() {
        let fetcher = MemoryFetcher::new();
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        // nothing registered for the uri, the fetch fails
        let parent = cache
            .load_external_buffer(DataLocation::Url("mem://missing.bin".into()), false)
            .expect("parent");
        let view_key = CacheKey::buffer_view("doc", 9);
        let view = cache
            .get_or_load(view_key.clone(), false, |_| {
                Ok(BufferViewLoader::new(view_key.clone(), parent.clone(), 0, 4))
            })
            .expect("view");
        cache.release(parent);

        let loader = IndexBufferLoader::new(
            CacheKey::index_buffer("doc", 9),
            IndexSource::View(view),
            ComponentType::U16,
            2,
            false,
            garbage,
        );
        loader.clone().load();

        let mut frame_number = 1;
        while loader.state().is_active() {
            let mut frame = FrameContext::new(&mut cache, &mut gpu, frame_number);
            loader.update(&mut frame);
            frame_number += 1;
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            loader.signal().settled().await,
            Err(ResourceError::Dependency { .. })
        ));
        assert!(gpu.buffers_created.is_empty());
    }
}
