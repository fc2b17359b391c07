use crate::buffer_view::BufferViewLoader;
use crate::format::ComponentType;
use bytes::Bytes;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::frame::FrameContext;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One decompressed vertex attribute. The data is a fresh allocation, never a
/// view into the compressed source.
#[derive(Debug, Clone)]
pub struct DecodedDracoAttribute {
    pub component_type: ComponentType,
    pub components: usize,
    pub count: usize,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct DecodedDracoIndices {
    pub component_type: ComponentType,
    pub count: usize,
    pub data: Bytes,
}

/// Result of one Draco decode, keyed by glTF attribute semantic.
#[derive(Debug, Clone, Default)]
pub struct DecodedDraco {
    pub attributes: HashMap<String, DecodedDracoAttribute>,
    pub indices: Option<DecodedDracoIndices>,
}

/// Raw shape of the Draco mesh-compression extension on a primitive.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DracoExtension {
    #[serde(rename = "bufferView")]
    pub buffer_view: usize,
    #[serde(default)]
    pub attributes: HashMap<String, u64>,
}

/// Geometry decompressor collaborator. `attribute_ids` maps glTF attribute
/// semantics to Draco attribute ids as declared by the extension.
pub trait DracoDecoder: Send + Sync + 'static {
    fn decode(
        &self,
        data: &[u8],
        attribute_ids: &HashMap<String, u64>,
    ) -> Result<DecodedDraco, String>;
}

enum Stage {
    /// Waiting for the compressed buffer view
    AwaitingView,
    /// Compressed bytes staged, decode not yet admitted by the frame budget
    AwaitingSlot(Bytes),
    /// Decode running on the blocking pool
    Decoding(crossbeam_channel::Receiver<Result<DecodedDraco, String>>),
    Done,
}

struct Inner {
    view: Option<ResourceHandle<BufferViewLoader>>,
    stage: Stage,
    decoded: Option<Arc<DecodedDraco>>,
    last_frame: Option<u64>,
}

/// Decodes Draco-compressed geometry from a buffer view.
///
/// The decode runs off the driving thread and is admitted by the per-frame
/// decode budget, so one slow decode never blocks a frame; `update` must keep
/// being called until the loader settles.
pub struct DracoLoader {
    core: LoaderCore,
    decoder: Arc<dyn DracoDecoder>,
    attribute_ids: HashMap<String, u64>,
    inner: Mutex<Inner>,
}

impl DracoLoader {
    pub fn new(
        key: CacheKey,
        view: ResourceHandle<BufferViewLoader>,
        decoder: Arc<dyn DracoDecoder>,
        attribute_ids: HashMap<String, u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            decoder,
            attribute_ids,
            inner: Mutex::new(Inner {
                view: Some(view),
                stage: Stage::AwaitingView,
                decoded: None,
                last_frame: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Decoded geometry, available once `Ready`.
    pub fn decoded(&self) -> Option<Arc<DecodedDraco>> {
        self.inner().decoded.clone()
    }
}

impl ResourceLoader for DracoLoader {
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
        let view_signal = match self.inner().view.as_ref() {
            Some(view) => view.signal(),
            None => return,
        };
        tokio::spawn(async move {
            let settled = view_signal.settled().await;
            let mut inner = loader.inner();
            if loader.core.is_destroyed() {
                return;
            }
            match settled.and_then(|()| {
                inner
                    .view
                    .as_ref()
                    .and_then(|view| view.bytes())
                    .ok_or(ResourceError::Destroyed)
            }) {
                Ok(bytes) => {
                    inner.stage = Stage::AwaitingSlot(bytes);
                    drop(inner);
                    loader.core.begin_processing();
                }
                Err(error) => {
                    inner.view = None;
                    drop(inner);
                    loader.core.fail(ResourceError::dependency(
                        "Failed to load Draco geometry",
                        error,
                    ));
                }
            }
        });
    }

    fn update(&self, frame: &mut FrameContext<'_>) {
        if self.state() != ResourceLoaderState::Processing {
            return;
        }
        let mut inner = self.inner();
        // vertex and index loaders share one Draco loader; advance one stage
        // per frame, not one per caller
        if inner.last_frame == Some(frame.frame_number) {
            return;
        }
        inner.last_frame = Some(frame.frame_number);

        match std::mem::replace(&mut inner.stage, Stage::Done) {
            Stage::AwaitingView => inner.stage = Stage::AwaitingView,
            Stage::Done => {}
            Stage::AwaitingSlot(bytes) => {
                if !frame.take_decode_slot() {
                    // worker pool saturated this frame, retry on the next one
                    inner.stage = Stage::AwaitingSlot(bytes);
                    return;
                }
                let (send, recv) = crossbeam_channel::bounded(1);
                let decoder = self.decoder.clone();
                let attribute_ids = self.attribute_ids.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = send.send(decoder.decode(&bytes, &attribute_ids));
                });
                inner.stage = Stage::Decoding(recv);
            }
            Stage::Decoding(recv) => match recv.try_recv() {
                Ok(Ok(decoded)) => {
                    // keep only the decoded output, drop the compressed
                    // source and the view reference
                    inner.decoded = Some(Arc::new(decoded));
                    inner.view = None;
                    drop(inner);
                    self.core.finish();
                }
                Ok(Err(reason)) => {
                    inner.view = None;
                    drop(inner);
                    self.core
                        .fail(ResourceError::decode("Failed to decode Draco geometry", reason));
                }
                Err(crossbeam_channel::TryRecvError::Empty) => {
                    inner.stage = Stage::Decoding(recv);
                }
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    inner.view = None;
                    drop(inner);
                    self.core.fail(ResourceError::decode(
                        "Failed to decode Draco geometry",
                        "decode task dropped its result",
                    ));
                }
            },
        }
    }

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.view = None;
            inner.decoded = None;
            inner.stage = Stage::Done;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache_ext::GltfCacheExt;
    use lode_cache::cache::ResourceCache;
    use lode_cache::fetch::{DataLocation, MemoryFetcher};
    use lode_cache::gpu::RecordingGpu;

    /// Decoder that splits the payload into one POSITION attribute.
    pub(crate) struct StubDecoder;

    impl DracoDecoder for StubDecoder {
        fn decode(
            &self,
            data: &[u8],
            _attribute_ids: &HashMap<String, u64>,
        ) -> Result<DecodedDraco, String> {
            if data.is_empty() {
                return Err("empty draco stream".into());
            }
            let mut decoded = DecodedDraco::default();
            decoded.attributes.insert(
                "POSITION".into(),
                DecodedDracoAttribute {
                    component_type: ComponentType::F32,
                    components: 3,
                    count: data.len() / 12,
                    data: Bytes::copy_from_slice(data),
                },
            );
            decoded.indices = Some(DecodedDracoIndices {
                component_type: ComponentType::U16,
                count: 3,
                data: Bytes::from_static(&[0, 0, 1, 0, 2, 0]),
            });
            Ok(decoded)
        }
    }

    async fn ready_view(cache: &mut ResourceCache, uri: &str) -> ResourceHandle<BufferViewLoader> {
        let parent = cache
            .load_external_buffer(DataLocation::Url(uri.into()), false)
            .expect("parent");
        let key = CacheKey::buffer_view("draco-doc", 0);
        let view = cache
            .get_or_load(key.clone(), false, |_| {
                Ok(BufferViewLoader::new(key.clone(), parent.clone(), 0, 24))
            })
            .expect("view");
        view.signal().settled().await.expect("view ready");
        cache.release(parent);
        view
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decode_defers_without_a_slot_and_completes_with_one() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://geom.drc", Bytes::from_static(&[3u8; 24]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();

        let view = ready_view(&mut cache, "mem://geom.drc").await;
        let loader = DracoLoader::new(
            CacheKey::draco("draco-doc", 0),
            view,
            Arc::new(StubDecoder),
            HashMap::from([("POSITION".to_string(), 0u64)]),
        );
        loader.clone().load();

        // wait for the view continuation to stage the bytes
        while loader.state() == ResourceLoaderState::Loading {
            tokio::task::yield_now().await;
        }
        assert_eq!(loader.state(), ResourceLoaderState::Processing);

        // saturated pool: no slot, no progress
        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1).with_decode_slots(0);
        loader.update(&mut frame);
        drop(frame);
        assert!(loader.decoded().is_none());

        // admitted: schedule on frame 2, drain on later frames
        let mut frame_number = 2;
        while loader.state() == ResourceLoaderState::Processing {
            let mut frame = FrameContext::new(&mut cache, &mut gpu, frame_number);
            loader.update(&mut frame);
            frame_number += 1;
            tokio::task::yield_now().await;
        }
        loader.signal().settled().await.expect("decode settles");
        let decoded = loader.decoded().expect("decoded geometry");
        assert_eq!(decoded.attributes["POSITION"].count, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decoder_failure_fails_the_loader() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://empty.drc", Bytes::new());
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();

        let parent = cache
            .load_external_buffer(DataLocation::Url("mem://empty.drc".into()), false)
            .expect("parent");
        let key = CacheKey::buffer_view("draco-doc", 1);
        let view = cache
            .get_or_load(key.clone(), false, |_| {
                Ok(BufferViewLoader::new(key.clone(), parent.clone(), 0, 0))
            })
            .expect("view");
        view.signal().settled().await.expect("view ready");

        let loader = DracoLoader::new(
            CacheKey::draco("draco-doc", 1),
            view,
            Arc::new(StubDecoder),
            HashMap::new(),
        );
        loader.clone().load();
        let mut frame_number = 1;
        while loader.state().is_active() {
            let mut frame = FrameContext::new(&mut cache, &mut gpu, frame_number);
            loader.update(&mut frame);
            frame_number += 1;
            tokio::task::yield_now().await;
        }
        assert_eq!(loader.state(), ResourceLoaderState::Failed);
        assert!(matches!(
            loader.signal().settled().await,
            Err(ResourceError::Decode { .. })
        ));
        cache.release(parent);
    }
}
