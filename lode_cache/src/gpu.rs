use crate::error::ResourceError;
use bytes::Bytes;

/// Opaque GPU buffer id handed back by the device collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GpuBuffer(pub u64);

/// Opaque GPU texture id handed back by the device collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GpuTexture(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
}

/// Pixel layout of an upload. Compressed containers are carried opaque and
/// transcoded by the device layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    CompressedKtx,
    CompressedCrn,
    CompressedBasis,
}

#[derive(Debug, Clone)]
pub struct TextureUpload {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Bytes,
}

/// A created GPU resource queued for deferred destruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Buffer(GpuBuffer),
    Texture(GpuTexture),
}

/// GPU device seam. The real bindings live outside this crate; loaders only
/// need resource creation and teardown.
pub trait GpuContext: Send {
    fn create_buffer(&mut self, usage: BufferUsage, data: &[u8]) -> Result<GpuBuffer, ResourceError>;
    fn create_texture(&mut self, upload: &TextureUpload) -> Result<GpuTexture, ResourceError>;
    fn destroy_buffer(&mut self, buffer: GpuBuffer);
    fn destroy_texture(&mut self, texture: GpuTexture);
}

/// Recording device used by tests and headless runs: allocates monotonically
/// increasing ids and keeps creation counts.
#[derive(Debug, Default)]
pub struct RecordingGpu {
    next_id: u64,
    pub buffers_created: Vec<(BufferUsage, usize)>,
    pub textures_created: Vec<TextureUpload>,
    pub buffers_destroyed: Vec<GpuBuffer>,
    pub textures_destroyed: Vec<GpuTexture>,
}

impl RecordingGpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl GpuContext for RecordingGpu {
    fn create_buffer(&mut self, usage: BufferUsage, data: &[u8]) -> Result<GpuBuffer, ResourceError> {
        self.buffers_created.push((usage, data.len()));
        Ok(GpuBuffer(self.next()))
    }

    fn create_texture(&mut self, upload: &TextureUpload) -> Result<GpuTexture, ResourceError> {
        self.textures_created.push(upload.clone());
        Ok(GpuTexture(self.next()))
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.buffers_destroyed.push(buffer);
    }

    fn destroy_texture(&mut self, texture: GpuTexture) {
        self.textures_destroyed.push(texture);
    }
}
