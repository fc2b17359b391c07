use crate::image_loader::{DecodedImage, ImageCodec, ImageLoader};
use crate::options::SupportedImageFormats;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::frame::FrameContext;
use lode_cache::gpu::{GpuResource, GpuTexture, TextureFormat, TextureUpload};
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WrappingMode {
    ClampToEdge,
    MirroredRepeat,
    Repeat,
}

impl From<gltf::texture::WrappingMode> for WrappingMode {
    fn from(mode: gltf::texture::WrappingMode) -> Self {
        match mode {
            gltf::texture::WrappingMode::ClampToEdge => WrappingMode::ClampToEdge,
            gltf::texture::WrappingMode::MirroredRepeat => WrappingMode::MirroredRepeat,
            gltf::texture::WrappingMode::Repeat => WrappingMode::Repeat,
        }
    }
}

/// Sampler settings copied out of the document so the texture survives the
/// source json being released.
#[derive(Debug, Copy, Clone)]
pub struct TextureSampler {
    pub wrap_s: WrappingMode,
    pub wrap_t: WrappingMode,
    pub mag_filter: Option<gltf::texture::MagFilter>,
    pub min_filter: Option<gltf::texture::MinFilter>,
}

impl Default for TextureSampler {
    fn default() -> Self {
        Self {
            wrap_s: WrappingMode::Repeat,
            wrap_t: WrappingMode::Repeat,
            mag_filter: None,
            min_filter: None,
        }
    }
}

impl TextureSampler {
    pub fn from_gltf(sampler: &gltf::texture::Sampler<'_>) -> Self {
        Self {
            wrap_s: sampler.wrap_s().into(),
            wrap_t: sampler.wrap_t().into(),
            mag_filter: sampler.mag_filter(),
            min_filter: sampler.min_filter(),
        }
    }
}

#[derive(Default)]
struct Inner {
    image: Option<ResourceHandle<ImageLoader>>,
    staged: Option<TextureUpload>,
    texture: Option<GpuTexture>,
}

/// Uploads a decoded image to the GPU. The CPU-side image is released as soon
/// as the upload completes, so two textures sampling the same image differently
/// still share one decode.
pub struct TextureLoader {
    core: LoaderCore,
    sampler: TextureSampler,
    formats: SupportedImageFormats,
    asynchronous: bool,
    garbage: crossbeam_channel::Sender<GpuResource>,
    inner: Mutex<Inner>,
}

fn upload_for(
    image: &DecodedImage,
    formats: &SupportedImageFormats,
) -> Result<TextureUpload, ResourceError> {
    match image {
        DecodedImage::Rgba8 {
            width,
            height,
            pixels,
        } => Ok(TextureUpload {
            width: *width,
            height: *height,
            format: TextureFormat::Rgba8,
            data: pixels.clone(),
        }),
        DecodedImage::Compressed { codec, data } => {
            if !formats.accepts(*codec) {
                return Err(ResourceError::format(
                    "Failed to load texture",
                    format!("device has no transcode target for a {codec:?} container"),
                ));
            }
            let format = match codec {
                ImageCodec::Ktx => TextureFormat::CompressedKtx,
                ImageCodec::Crn => TextureFormat::CompressedCrn,
                ImageCodec::Basis => TextureFormat::CompressedBasis,
                other => {
                    return Err(ResourceError::format(
                        "Failed to load texture",
                        format!("{other:?} is not a compressed container"),
                    ));
                }
            };
            // container dimensions are read by the transcoder, not here
            Ok(TextureUpload {
                width: 0,
                height: 0,
                format,
                data: data.clone(),
            })
        }
    }
}

impl TextureLoader {
    pub fn new(
        key: CacheKey,
        image: ResourceHandle<ImageLoader>,
        sampler: TextureSampler,
        formats: SupportedImageFormats,
        asynchronous: bool,
        garbage: crossbeam_channel::Sender<GpuResource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            sampler,
            formats,
            asynchronous,
            garbage,
            inner: Mutex::new(Inner {
                image: Some(image),
                staged: None,
                texture: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn sampler(&self) -> TextureSampler {
        self.sampler
    }

    /// The GPU texture, available once `Ready`.
    pub fn gpu_texture(&self) -> Option<GpuTexture> {
        self.inner().texture
    }

    fn fail_and_release(&self, error: ResourceError) {
        {
            let mut inner = self.inner();
            inner.image = None;
            inner.staged = None;
        }
        self.core
            .fail(ResourceError::dependency("Failed to load texture", error));
    }
}

impl ResourceLoader for TextureLoader {
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
        match self.state() {
            ResourceLoaderState::Loading => {
                let settled = match self.inner().image.as_ref() {
                    Some(image) => image.signal().try_result(),
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
                        let staged = inner
                            .image
                            .as_ref()
                            .and_then(|image| image.image())
                            .ok_or(ResourceError::Destroyed)
                            .and_then(|image| upload_for(&image, &self.formats));
                        match staged {
                            Ok(upload) => inner.staged = Some(upload),
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
                match frame.gpu.create_texture(&staged) {
                    Ok(texture) => {
                        inner.texture = Some(texture);
                        // upload done, the CPU image can go
                        inner.image = None;
                        drop(inner);
                        self.core.finish();
                    }
                    Err(error) => {
                        inner.image = None;
                        drop(inner);
                        self.core
                            .fail(ResourceError::dependency("Failed to load texture", error));
                    }
                }
            }
            _ => {}
        }
    }

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.image = None;
            inner.staged = None;
            if let Some(texture) = inner.texture.take() {
                let _ = self.garbage.send(GpuResource::Texture(texture));
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
    use bytes::Bytes;
    use lode_cache::cache::ResourceCache;
    use lode_cache::fetch::{DataLocation, MemoryFetcher};
    use lode_cache::gpu::RecordingGpu;

    // 1x1 RGBA png
    const PNG_1X1: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0xDA, 0x63, 0xFC,
        0xCF, 0xC0, 0x50, 0x0F, 0x00, 0x04, 0x85, 0x01, 0x80, 0x84, 0xA9, 0x8C, 0x21, 0x00, 0x00,
        0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    async fn ready_image(cache: &mut ResourceCache, uri: &str) -> ResourceHandle<ImageLoader> {
        let image = cache
            .load_image_from_uri(DataLocation::Url(uri.into()), false)
            .expect("image");
        image.signal().settled().await.expect("image ready");
        image
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uploads_rgba8_and_releases_the_image() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://white.png", Bytes::from_static(PNG_1X1));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let image = ready_image(&mut cache, "mem://white.png").await;
        let loader = TextureLoader::new(
            CacheKey::texture("doc", 0, 0),
            image,
            TextureSampler::default(),
            SupportedImageFormats::default(),
            false,
            garbage,
        );
        loader.clone().load();

        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        assert_eq!(loader.state(), ResourceLoaderState::Ready);
        assert_eq!(gpu.textures_created.len(), 1);
        assert_eq!(gpu.textures_created[0].width, 1);
        assert_eq!(gpu.textures_created[0].format, TextureFormat::Rgba8);

        // the image handle was dropped, the next maintain destroys the loader
        cache.maintain();
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compressed_container_passes_through_unmodified() {
        let ktx = {
            let mut bytes = vec![0xABu8, 0x4B, 0x54, 0x58];
            bytes.extend_from_slice(&[0u8; 28]);
            Bytes::from(bytes)
        };
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://tiles.ktx", ktx.clone());
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let image = ready_image(&mut cache, "mem://tiles.ktx").await;
        let loader = TextureLoader::new(
            CacheKey::texture("doc", 1, 1),
            image,
            TextureSampler::default(),
            SupportedImageFormats {
                s3tc: true,
                ..SupportedImageFormats::default()
            },
            false,
            garbage,
        );
        loader.clone().load();

        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        assert_eq!(loader.state(), ResourceLoaderState::Ready);
        assert_eq!(gpu.textures_created[0].format, TextureFormat::CompressedKtx);
        assert_eq!(gpu.textures_created[0].data, ktx);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn container_without_transcode_target_is_rejected() {
        let ktx = {
            let mut bytes = vec![0xABu8, 0x4B, 0x54, 0x58];
            bytes.extend_from_slice(&[0u8; 28]);
            Bytes::from(bytes)
        };
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://tiles.ktx", ktx);
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let image = ready_image(&mut cache, "mem://tiles.ktx").await;
        // default device profile: no s3tc/pvrtc/etc1
        let loader = TextureLoader::new(
            CacheKey::texture("doc", 3, 1),
            image,
            TextureSampler::default(),
            SupportedImageFormats::default(),
            false,
            garbage,
        );
        loader.clone().load();

        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        assert_eq!(loader.state(), ResourceLoaderState::Failed);
        assert!(gpu.textures_created.is_empty());
        let error = loader.signal().settled().await.expect_err("rejected");
        assert!(error.to_string().contains("Failed to load texture"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroy_queues_the_gpu_texture() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://white.png", Bytes::from_static(PNG_1X1));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();
        let garbage = cache.gpu_garbage_sender();

        let image = ready_image(&mut cache, "mem://white.png").await;
        let loader = TextureLoader::new(
            CacheKey::texture("doc", 2, 0),
            image,
            TextureSampler::default(),
            SupportedImageFormats::default(),
            false,
            garbage,
        );
        loader.clone().load();
        let mut frame = FrameContext::new(&mut cache, &mut gpu, 1);
        loader.update(&mut frame);
        drop(frame);
        let texture = loader.gpu_texture().expect("created");

        loader.destroy();
        cache.flush_gpu_garbage(&mut gpu);
        assert_eq!(gpu.textures_destroyed, vec![texture]);
    }
}
