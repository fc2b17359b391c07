use crate::draco::DracoDecoder;
use crate::image_loader::ImageCodec;
use std::sync::Arc;

/// Compressed-texture capabilities of the target device, used to pick which
/// variant of a multi-format image declaration is requested.
#[derive(Debug, Copy, Clone)]
pub struct SupportedImageFormats {
    pub webp: bool,
    pub s3tc: bool,
    pub pvrtc: bool,
    pub etc1: bool,
}

impl Default for SupportedImageFormats {
    fn default() -> Self {
        Self {
            webp: true,
            s3tc: false,
            pvrtc: false,
            etc1: false,
        }
    }
}

impl SupportedImageFormats {
    /// Whether the device has a transcode target for the given compressed
    /// container. Raster codecs always pass; they decode to RGBA8.
    pub fn accepts(&self, codec: ImageCodec) -> bool {
        match codec {
            // crunch decompresses to DXT
            ImageCodec::Crn => self.s3tc,
            ImageCodec::Ktx | ImageCodec::Basis => self.s3tc || self.pvrtc || self.etc1,
            _ => true,
        }
    }
}

/// Configuration surface of the loader chain.
#[derive(Clone)]
pub struct GltfLoadOptions {
    /// Keep the JSON document and its embedded buffers cached after the last
    /// consumer releases them, trading memory for repeat-load latency.
    pub keep_resident: bool,
    /// Spread GPU resource creation across frames instead of blocking the
    /// current one.
    pub asynchronous: bool,
    pub supported_formats: SupportedImageFormats,
    /// Geometry decompressor; documents using Draco compression fail to load
    /// without one.
    pub draco_decoder: Option<Arc<dyn DracoDecoder>>,
}

impl Default for GltfLoadOptions {
    fn default() -> Self {
        Self {
            keep_resident: false,
            asynchronous: true,
            supported_formats: SupportedImageFormats::default(),
            draco_decoder: None,
        }
    }
}

impl GltfLoadOptions {
    pub fn new() -> Self {
        Self::default()
    }
}
