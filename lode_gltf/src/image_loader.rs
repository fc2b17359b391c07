use crate::buffer_view::BufferViewLoader;
use bytes::Bytes;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::fetch::{DataLocation, Fetcher, data_uri_media_type};
use lode_cache::frame::FrameContext;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

/// Image codecs recognized by magic-byte sniffing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageCodec {
    Bmp,
    Gif,
    Jpeg,
    Png,
    Ktx,
    Crn,
    Basis,
    WebP,
}

impl ImageCodec {
    /// Compressed-texture containers are carried opaque to the GPU layer
    /// instead of being decoded to RGBA.
    pub fn is_compressed_container(&self) -> bool {
        matches!(self, ImageCodec::Ktx | ImageCodec::Crn | ImageCodec::Basis)
    }
}

/// Identify the codec from the payload's leading bytes.
pub fn sniff_codec(bytes: &[u8]) -> Option<ImageCodec> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageCodec::WebP);
    }
    if bytes.len() < 2 {
        return None;
    }
    match [bytes[0], bytes[1]] {
        [0x42, 0x49] => Some(ImageCodec::Bmp),
        [0x47, 0x49] => Some(ImageCodec::Gif),
        [0xFF, 0xD8] => Some(ImageCodec::Jpeg),
        [0x89, 0x50] => Some(ImageCodec::Png),
        [0xAB, 0x4B] => Some(ImageCodec::Ktx),
        [0x48, 0x78] => Some(ImageCodec::Crn),
        [0x73, 0x42] => Some(ImageCodec::Basis),
        _ => None,
    }
}

/// Codec forced by the URI itself, without byte inspection. Only the
/// compressed containers are dispatched this way.
pub fn codec_from_uri(uri: &str) -> Option<ImageCodec> {
    if let Some(media) = data_uri_media_type(uri) {
        return match media {
            "image/ktx" | "image/ktx2" => Some(ImageCodec::Ktx),
            "image/crn" => Some(ImageCodec::Crn),
            _ => None,
        };
    }
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    if path.ends_with(".ktx") {
        Some(ImageCodec::Ktx)
    } else if path.ends_with(".crn") {
        Some(ImageCodec::Crn)
    } else {
        None
    }
}

/// Output of the decode step.
#[derive(Debug, Clone)]
pub enum DecodedImage {
    /// Decoded to tightly packed RGBA8
    Rgba8 {
        width: u32,
        height: u32,
        pixels: Bytes,
    },
    /// Compressed-texture container handed to the GPU layer as-is
    Compressed { codec: ImageCodec, data: Bytes },
}

fn decode_image(bytes: Bytes, forced: Option<ImageCodec>) -> Result<DecodedImage, ResourceError> {
    let codec = forced.or_else(|| sniff_codec(&bytes)).ok_or_else(|| {
        ResourceError::format("Failed to load image", "invalid header: unknown image format")
    })?;
    if codec.is_compressed_container() {
        return Ok(DecodedImage::Compressed { codec, data: bytes });
    }
    let format = match codec {
        ImageCodec::Bmp => image::ImageFormat::Bmp,
        ImageCodec::Gif => image::ImageFormat::Gif,
        ImageCodec::Jpeg => image::ImageFormat::Jpeg,
        ImageCodec::Png => image::ImageFormat::Png,
        ImageCodec::WebP => image::ImageFormat::WebP,
        _ => unreachable!("compressed containers handled above"),
    };
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| ResourceError::decode("Failed to decode image", e))?;
    let rgba = decoded.into_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage::Rgba8 {
        width,
        height,
        pixels: Bytes::from(rgba.into_raw()),
    })
}

enum Source {
    /// Embedded image bytes referenced through a buffer view
    BufferView,
    /// Standalone image fetched from a URI
    Uri {
        location: DataLocation,
        fetcher: Arc<dyn Fetcher>,
    },
}

#[derive(Default)]
struct Inner {
    view: Option<ResourceHandle<BufferViewLoader>>,
    image: Option<DecodedImage>,
}

/// Decodes an image or compressed-texture container from a buffer view or a
/// URI. The codec is chosen by URI suffix when forced, otherwise by magic
/// bytes.
pub struct ImageLoader {
    core: LoaderCore,
    source: Source,
    forced_codec: Option<ImageCodec>,
    inner: Mutex<Inner>,
}

impl ImageLoader {
    pub fn from_buffer_view(key: CacheKey, view: ResourceHandle<BufferViewLoader>) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            source: Source::BufferView,
            forced_codec: None,
            inner: Mutex::new(Inner {
                view: Some(view),
                image: None,
            }),
        })
    }

    pub fn from_uri(
        key: CacheKey,
        location: DataLocation,
        fetcher: Arc<dyn Fetcher>,
        forced_codec: Option<ImageCodec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            source: Source::Uri { location, fetcher },
            forced_codec,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The decoded image, available once `Ready`.
    pub fn image(&self) -> Option<DecodedImage> {
        self.inner().image.clone()
    }

    async fn acquire_bytes(self: &Arc<Self>) -> Result<Bytes, ResourceError> {
        match &self.source {
            Source::BufferView => {
                let signal = self
                    .inner()
                    .view
                    .as_ref()
                    .map(|view| view.signal())
                    .ok_or(ResourceError::Destroyed)?;
                signal
                    .settled()
                    .await
                    .map_err(|e| ResourceError::dependency("Failed to load embedded image", e))?;
                self.inner()
                    .view
                    .as_ref()
                    .and_then(|view| view.bytes())
                    .ok_or(ResourceError::Destroyed)
            }
            Source::Uri { location, fetcher } => fetcher
                .fetch(location)
                .await
                .map_err(|e| ResourceError::dependency("Failed to load image", e)),
        }
    }

    fn complete(&self, decoded: Result<DecodedImage, ResourceError>) {
        let mut inner = self.inner();
        if self.core.is_destroyed() {
            return;
        }
        match decoded {
            Ok(image) => {
                inner.image = Some(image);
                // the decoded image is a fresh allocation, the view bytes are
                // no longer needed
                inner.view = None;
                drop(inner);
                self.core.finish();
            }
            Err(error) => {
                inner.view = None;
                inner.image = None;
                drop(inner);
                self.core.fail(error);
            }
        }
    }
}

impl ResourceLoader for ImageLoader {
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
            let decoded = match loader.acquire_bytes().await {
                Ok(bytes) => {
                    let forced = loader.forced_codec;
                    tokio::task::spawn_blocking(move || decode_image(bytes, forced))
                        .await
                        .unwrap_or_else(|e| {
                            Err(ResourceError::decode("Failed to decode image", e))
                        })
                }
                Err(error) => Err(error),
            };
            loader.complete(decoded);
        });
    }

    fn update(&self, _frame: &mut FrameContext<'_>) {}

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.view = None;
            inner.image = None;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
