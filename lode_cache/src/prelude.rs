pub use crate::cache::{ResourceCache, ResourceHandle};
pub use crate::error::ResourceError;
pub use crate::fetch::{DataLocation, Fetcher};
pub use crate::frame::FrameContext;
pub use crate::gpu::{BufferUsage, GpuBuffer, GpuContext, GpuTexture};
pub use crate::key::CacheKey;
pub use crate::loader::{LoaderCore, ResourceLoader};
pub use crate::signal::LoadSignal;
pub use crate::state::ResourceLoaderState;
