//! glTF loader pipeline on top of [`lode_cache`].
//!
//! [`GltfLoader`](loader::GltfLoader) walks a glTF 2.0 / GLB document and
//! turns it into GPU-ready [`model`] components through a tree of cached
//! loaders: buffers, buffer views, images, Draco-compressed geometry, vertex
//! and index buffers, textures, and feature metadata. All loaders share the
//! single-flight cache, so two primitives referencing the same texture URI
//! resolve to one image fetch and one GPU upload.

pub mod buffer;
pub mod buffer_view;
pub mod cache_ext;
pub mod draco;
pub mod format;
pub mod image_loader;
pub mod index_buffer;
pub mod json;
pub mod loader;
pub mod metadata;
pub mod model;
pub mod options;
pub mod texture;
pub mod vertex_buffer;

pub use buffer::BufferLoader;
pub use buffer_view::BufferViewLoader;
pub use cache_ext::GltfCacheExt;
pub use draco::{DecodedDraco, DracoDecoder, DracoLoader};
pub use image_loader::{DecodedImage, ImageCodec, ImageLoader};
pub use index_buffer::IndexBufferLoader;
pub use json::{GltfDocument, GltfJsonLoader};
pub use loader::GltfLoader;
pub use metadata::{FeatureMetadataLoader, MetadataGltfExtension, MetadataSchema, SchemaLoader};
pub use model::ModelComponents;
pub use options::{GltfLoadOptions, SupportedImageFormats};
pub use texture::TextureLoader;
pub use vertex_buffer::VertexBufferLoader;
