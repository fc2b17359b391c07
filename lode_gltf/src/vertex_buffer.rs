use crate::buffer_view::BufferViewLoader;
use crate::draco::DracoLoader;
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

/// Source geometry for a vertex buffer: a plain buffer view, or one attribute
/// of a Draco-compressed primitive. Never both.
pub enum VertexSource {
    View(ResourceHandle<BufferViewLoader>),
    Draco {
        loader: ResourceHandle<DracoLoader>,
        attribute: String,
    },
}

impl VertexSource {
    fn signal(&self) -> LoadSignal {
        match self {
            VertexSource::View(view) => view.signal(),
            VertexSource::Draco { loader, .. } => loader.signal(),
        }
    }
}

#[derive(Default)]
struct Inner {
    source: Option<VertexSource>,
    staged: Option<Bytes>,
    buffer: Option<GpuBuffer>,
}

/// Turns a buffer view or Draco output into a GPU vertex buffer.
///
/// With `asynchronous` set, staging and GPU creation happen on consecutive
/// frames instead of blocking the current one.
pub struct VertexBufferLoader {
    core: LoaderCore,
    asynchronous: bool,
    garbage: crossbeam_channel::Sender<GpuResource>,
    inner: Mutex<Inner>,
}

impl VertexBufferLoader {
    pub fn new(
        key: CacheKey,
        source: VertexSource,
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
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The GPU buffer, available once `Ready`.
    pub fn gpu_buffer(&self) -> Option<GpuBuffer> {
        self.inner().buffer
    }

    fn stage(&self, inner: &mut Inner) -> Result<Bytes, ResourceError> {
        match inner.source.as_ref() {
            Some(VertexSource::View(view)) => view.bytes().ok_or(ResourceError::Destroyed),
            Some(VertexSource::Draco { loader, attribute }) => loader
                .decoded()
                .and_then(|decoded| decoded.attributes.get(attribute).map(|a| a.data.clone()))
                .ok_or_else(|| {
                    ResourceError::decode(
                        "Failed to load vertex buffer",
                        format!("decoded Draco output has no {attribute} attribute"),
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
            .fail(ResourceError::dependency("Failed to load vertex buffer", error));
    }
}

impl ResourceLoader for VertexBufferLoader {
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
        // a shared Draco loader is driven by whichever parent updates first
        if let Some(VertexSource::Draco { loader, .. }) = self.inner().source.as_ref() {
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
                        match self.stage(&mut inner) {
                            Ok(bytes) => inner.staged = Some(bytes),
                            Err(error) => {
                                drop(inner);
                                self.fail_and_release(error);
                                return;
                            }
                        }
                        drop(inner);
                        if !self.asynchronous {
                            // blocking mode finishes within the same frame
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
                match frame.gpu.create_buffer(BufferUsage::Vertex, &staged) {
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
                            .fail(ResourceError::dependency("Failed to load vertex buffer", error));
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
    use lode_cache::cache::ResourceCache;
    use lode_cache::fetch::{DataLocation, MemoryFetcher};
    use lode_cache::gpu::RecordingGpu;

    async fn view_handle(
        cache: &mut ResourceCache,
        uri: &str,
        len: usize,
    ) -> ResourceHandle<BufferViewLoader> {
        let parent = cache
            .load_external_buffer(DataLocation::Url(uri.into()), false)
            .expect("parent");
        let key = CacheKey::buffer_view(uri, 0);
        let view = cache
            .get_or_load(key.clone(), false, |_| {
                Ok(BufferViewLoader::new(key.clone(), parent.clone(), 0, len))
            })
            .expect("view");
        view.signal().settled().await.expect("view ready");
        cache.release(parent);
        view
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn asynchronous_mode_spreads_gpu_creation_across_frames() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://v.bin", Bytes::from_static(&[1u8; 36]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let view = view_handle(&mut cache, "mem://v.bin", 36).await;
        let loader = VertexBufferLoader::new(
            CacheKey::vertex_buffer("doc", 0),
            VertexSource::View(view),
            true,
            garbage,
        );
        loader.clone().load();

        // frame 1: dependency observed, bytes staged, no GPU work yet
        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        assert_eq!(loader.state(), ResourceLoaderState::Processing);
        assert!(gpu.buffers_created.is_empty());

        // frame 2: GPU buffer created
        let mut frame = FrameContext::new(&mut cache, &mut gpu, 2);
        loader.update(&mut frame);
        drop(frame);
        assert_eq!(loader.state(), ResourceLoaderState::Ready);
        assert_eq!(gpu.buffers_created, vec![(BufferUsage::Vertex, 36)]);
        assert!(loader.gpu_buffer().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn synchronous_mode_finishes_in_one_frame() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://v2.bin", Bytes::from_static(&[2u8; 12]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let view = view_handle(&mut cache, "mem://v2.bin", 12).await;
        let loader = VertexBufferLoader::new(
            CacheKey::vertex_buffer("doc", 1),
            VertexSource::View(view),
            false,
            garbage,
        );
        loader.clone().load();

        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        assert_eq!(loader.state(), ResourceLoaderState::Ready);
        assert_eq!(gpu.buffers_created.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroyed_loader_queues_its_gpu_buffer() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://v3.bin", Bytes::from_static(&[3u8; 8]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let view = view_handle(&mut cache, "mem://v3.bin", 8).await;
        let loader = VertexBufferLoader::new(
            CacheKey::vertex_buffer("doc", 2),
            VertexSource::View(view),
            false,
            garbage,
        );
        loader.clone().load();
        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        let buffer = loader.gpu_buffer().expect("created");

        loader.destroy();
        cache.flush_gpu_garbage(&mut gpu);
        assert_eq!(gpu.buffers_destroyed, vec![buffer]);
    }
}
