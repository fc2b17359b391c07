use crate::buffer::BufferLoader;
use crate::buffer_view::BufferViewLoader;
use crate::draco::{DracoDecoder, DracoExtension, DracoLoader};
use crate::format::ComponentType;
use crate::image_loader::{codec_from_uri, ImageLoader};
use crate::index_buffer::{IndexBufferLoader, IndexSource};
use crate::json::{GltfDocument, GltfJsonLoader};
use crate::metadata::{FeatureMetadataExtension, FeatureMetadataLoader, SchemaLoader};
use crate::options::GltfLoadOptions;
use crate::texture::{TextureLoader, TextureSampler};
use crate::vertex_buffer::{VertexBufferLoader, VertexSource};
use bytes::Bytes;
use lode_cache::cache::{ResourceCache, ResourceHandle};
use lode_cache::error::ResourceError;
use lode_cache::fetch::DataLocation;
use lode_cache::key::CacheKey;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The public `load_*` surface: one request method per resource kind, each
/// returning a counted handle. Repeated requests for the same key share one
/// loader and one unit of work.
pub trait GltfCacheExt {
    fn load_external_buffer(
        &mut self,
        location: DataLocation,
        keep_resident: bool,
    ) -> Result<ResourceHandle<BufferLoader>, ResourceError>;

    fn load_embedded_buffer(
        &mut self,
        document: &str,
        buffer_index: usize,
        bytes: Bytes,
        keep_resident: bool,
    ) -> Result<ResourceHandle<BufferLoader>, ResourceError>;

    fn load_buffer_view(
        &mut self,
        document: &Arc<GltfDocument>,
        view_index: usize,
        keep_resident: bool,
    ) -> Result<ResourceHandle<BufferViewLoader>, ResourceError>;

    fn load_image_from_uri(
        &mut self,
        location: DataLocation,
        keep_resident: bool,
    ) -> Result<ResourceHandle<ImageLoader>, ResourceError>;

    fn load_image(
        &mut self,
        document: &Arc<GltfDocument>,
        image_index: usize,
        keep_resident: bool,
    ) -> Result<ResourceHandle<ImageLoader>, ResourceError>;

    fn load_draco(
        &mut self,
        document: &Arc<GltfDocument>,
        draco: &DracoExtension,
        decoder: Arc<dyn DracoDecoder>,
        keep_resident: bool,
    ) -> Result<ResourceHandle<DracoLoader>, ResourceError>;

    fn load_vertex_buffer(
        &mut self,
        document: &Arc<GltfDocument>,
        accessor: &gltf::Accessor<'_>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<VertexBufferLoader>, ResourceError>;

    fn load_vertex_buffer_draco(
        &mut self,
        document: &Arc<GltfDocument>,
        draco: &DracoExtension,
        attribute: &str,
        decoder: Arc<dyn DracoDecoder>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<VertexBufferLoader>, ResourceError>;

    fn load_index_buffer(
        &mut self,
        document: &Arc<GltfDocument>,
        accessor: &gltf::Accessor<'_>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<IndexBufferLoader>, ResourceError>;

    fn load_index_buffer_draco(
        &mut self,
        document: &Arc<GltfDocument>,
        draco: &DracoExtension,
        accessor: &gltf::Accessor<'_>,
        decoder: Arc<dyn DracoDecoder>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<IndexBufferLoader>, ResourceError>;

    fn load_texture(
        &mut self,
        document: &Arc<GltfDocument>,
        texture_index: usize,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<TextureLoader>, ResourceError>;

    fn load_feature_metadata(
        &mut self,
        document: &Arc<GltfDocument>,
        raw: &serde_json::Value,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<FeatureMetadataLoader>, ResourceError>;

    fn load_gltf_json(
        &mut self,
        location: DataLocation,
        keep_resident: bool,
    ) -> Result<ResourceHandle<GltfJsonLoader>, ResourceError>;
}

/// Image variant actually requested for a texture: the webp source when the
/// extension declares one and the consumer supports it, else the core source.
fn select_image_index(document: &GltfDocument, texture_index: usize, options: &GltfLoadOptions) -> Option<usize> {
    let texture = document.document.textures().nth(texture_index)?;
    if options.supported_formats.webp {
        let webp = document
            .root
            .textures
            .get(texture_index)
            .and_then(|t| t.extensions.as_ref())
            .and_then(|ext| ext.others.get("EXT_texture_webp"))
            .and_then(|webp| webp.get("source"))
            .and_then(|source| source.as_u64());
        if let Some(source) = webp {
            return Some(source as usize);
        }
    }
    Some(texture.source().index())
}

impl GltfCacheExt for ResourceCache {
    fn load_external_buffer(
        &mut self,
        location: DataLocation,
        keep_resident: bool,
    ) -> Result<ResourceHandle<BufferLoader>, ResourceError> {
        let key = CacheKey::external_buffer(&location.identity());
        self.get_or_load(key.clone(), keep_resident, |cache| {
            Ok(BufferLoader::external(key, location, cache.fetcher()))
        })
    }

    fn load_embedded_buffer(
        &mut self,
        document: &str,
        buffer_index: usize,
        bytes: Bytes,
        keep_resident: bool,
    ) -> Result<ResourceHandle<BufferLoader>, ResourceError> {
        let key = CacheKey::embedded_buffer(document, buffer_index);
        self.get_or_load(key.clone(), keep_resident, |_| {
            Ok(BufferLoader::embedded(key, bytes))
        })
    }

    fn load_buffer_view(
        &mut self,
        document: &Arc<GltfDocument>,
        view_index: usize,
        keep_resident: bool,
    ) -> Result<ResourceHandle<BufferViewLoader>, ResourceError> {
        let key = CacheKey::buffer_view(&document.identity, view_index);
        self.get_or_load(key.clone(), keep_resident, |_| {
            let view = document.document.views().nth(view_index).ok_or_else(|| {
                ResourceError::format(
                    document.identity.clone(),
                    format!("no bufferView at index {view_index}"),
                )
            })?;
            let parent = document
                .buffer_handle(view.buffer().index())
                .cloned()
                .ok_or_else(|| {
                    ResourceError::format(
                        document.identity.clone(),
                        format!("bufferView {view_index} references an unloaded buffer"),
                    )
                })?;
            Ok(BufferViewLoader::new(
                key,
                parent,
                view.offset(),
                view.length(),
            ))
        })
    }

    fn load_image_from_uri(
        &mut self,
        location: DataLocation,
        keep_resident: bool,
    ) -> Result<ResourceHandle<ImageLoader>, ResourceError> {
        let identity = location.identity();
        let key = CacheKey::image_uri(&identity);
        let forced = codec_from_uri(&identity);
        self.get_or_load(key.clone(), keep_resident, |cache| {
            Ok(ImageLoader::from_uri(key, location, cache.fetcher(), forced))
        })
    }

    fn load_image(
        &mut self,
        document: &Arc<GltfDocument>,
        image_index: usize,
        keep_resident: bool,
    ) -> Result<ResourceHandle<ImageLoader>, ResourceError> {
        let key = CacheKey::image(&document.identity, image_index);
        self.get_or_load(key.clone(), keep_resident, |cache| {
            let image = document.document.images().nth(image_index).ok_or_else(|| {
                ResourceError::format(
                    document.identity.clone(),
                    format!("no image at index {image_index}"),
                )
            })?;
            match image.source() {
                gltf::image::Source::View { view, .. } => {
                    let view = cache.load_buffer_view(document, view.index(), keep_resident)?;
                    Ok(ImageLoader::from_buffer_view(key, view))
                }
                gltf::image::Source::Uri { uri, .. } => {
                    let location = document.location.resolve_relative(uri)?;
                    let forced = codec_from_uri(uri);
                    Ok(ImageLoader::from_uri(key, location, cache.fetcher(), forced))
                }
            }
        })
    }

    fn load_draco(
        &mut self,
        document: &Arc<GltfDocument>,
        draco: &DracoExtension,
        decoder: Arc<dyn DracoDecoder>,
        keep_resident: bool,
    ) -> Result<ResourceHandle<DracoLoader>, ResourceError> {
        let key = CacheKey::draco(&document.identity, draco.buffer_view);
        self.get_or_load(key.clone(), keep_resident, |cache| {
            let view = cache.load_buffer_view(document, draco.buffer_view, keep_resident)?;
            Ok(DracoLoader::new(key, view, decoder, draco.attributes.clone()))
        })
    }

    fn load_vertex_buffer(
        &mut self,
        document: &Arc<GltfDocument>,
        accessor: &gltf::Accessor<'_>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<VertexBufferLoader>, ResourceError> {
        let key = CacheKey::vertex_buffer(&document.identity, accessor.index());
        let view_index = accessor
            .view()
            .map(|view| view.index())
            .ok_or_else(|| {
                ResourceError::format(
                    document.identity.clone(),
                    format!("accessor {} has no bufferView", accessor.index()),
                )
            })?;
        self.get_or_load(key.clone(), options.keep_resident, |cache| {
            let view = cache.load_buffer_view(document, view_index, options.keep_resident)?;
            Ok(VertexBufferLoader::new(
                key,
                VertexSource::View(view),
                options.asynchronous,
                cache.gpu_garbage_sender(),
            ))
        })
    }

    fn load_vertex_buffer_draco(
        &mut self,
        document: &Arc<GltfDocument>,
        draco: &DracoExtension,
        attribute: &str,
        decoder: Arc<dyn DracoDecoder>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<VertexBufferLoader>, ResourceError> {
        let key = CacheKey::vertex_buffer_draco(&document.identity, draco.buffer_view, attribute);
        self.get_or_load(key.clone(), options.keep_resident, |cache| {
            let loader = cache.load_draco(document, draco, decoder, options.keep_resident)?;
            Ok(VertexBufferLoader::new(
                key,
                VertexSource::Draco {
                    loader,
                    attribute: attribute.to_owned(),
                },
                options.asynchronous,
                cache.gpu_garbage_sender(),
            ))
        })
    }

    fn load_index_buffer(
        &mut self,
        document: &Arc<GltfDocument>,
        accessor: &gltf::Accessor<'_>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<IndexBufferLoader>, ResourceError> {
        let key = CacheKey::index_buffer(&document.identity, accessor.index());
        let view_index = accessor
            .view()
            .map(|view| view.index())
            .ok_or_else(|| {
                ResourceError::format(
                    document.identity.clone(),
                    format!("index accessor {} has no bufferView", accessor.index()),
                )
            })?;
        let component_type = ComponentType::from(accessor.data_type());
        let count = accessor.count();
        self.get_or_load(key.clone(), options.keep_resident, |cache| {
            let view = cache.load_buffer_view(document, view_index, options.keep_resident)?;
            Ok(IndexBufferLoader::new(
                key,
                IndexSource::View(view),
                component_type,
                count,
                options.asynchronous,
                cache.gpu_garbage_sender(),
            ))
        })
    }

    fn load_index_buffer_draco(
        &mut self,
        document: &Arc<GltfDocument>,
        draco: &DracoExtension,
        accessor: &gltf::Accessor<'_>,
        decoder: Arc<dyn DracoDecoder>,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<IndexBufferLoader>, ResourceError> {
        let key = CacheKey::index_buffer_draco(&document.identity, draco.buffer_view);
        let component_type = ComponentType::from(accessor.data_type());
        let count = accessor.count();
        self.get_or_load(key.clone(), options.keep_resident, |cache| {
            let loader = cache.load_draco(document, draco, decoder, options.keep_resident)?;
            Ok(IndexBufferLoader::new(
                key,
                IndexSource::Draco(loader),
                component_type,
                count,
                options.asynchronous,
                cache.gpu_garbage_sender(),
            ))
        })
    }

    fn load_texture(
        &mut self,
        document: &Arc<GltfDocument>,
        texture_index: usize,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<TextureLoader>, ResourceError> {
        let image_index = select_image_index(document, texture_index, options).ok_or_else(|| {
            ResourceError::format(
                document.identity.clone(),
                format!("no texture at index {texture_index}"),
            )
        })?;
        let key = CacheKey::texture(&document.identity, texture_index, image_index);
        self.get_or_load(key.clone(), options.keep_resident, |cache| {
            let texture = document
                .document
                .textures()
                .nth(texture_index)
                .ok_or_else(|| {
                    ResourceError::format(
                        document.identity.clone(),
                        format!("no texture at index {texture_index}"),
                    )
                })?;
            let sampler = TextureSampler::from_gltf(&texture.sampler());
            let image = cache.load_image(document, image_index, options.keep_resident)?;
            Ok(TextureLoader::new(
                key,
                image,
                sampler,
                options.supported_formats,
                options.asynchronous,
                cache.gpu_garbage_sender(),
            ))
        })
    }

    fn load_feature_metadata(
        &mut self,
        document: &Arc<GltfDocument>,
        raw: &serde_json::Value,
        options: &GltfLoadOptions,
    ) -> Result<ResourceHandle<FeatureMetadataLoader>, ResourceError> {
        let extension: FeatureMetadataExtension = serde_json::from_value(raw.clone())
            .map_err(|e| ResourceError::format("Failed to load feature metadata", e))?;
        let key = CacheKey::feature_metadata(&document.identity);
        let keep_resident = options.keep_resident;
        self.get_or_load(key.clone(), keep_resident, |cache| {
            let schema = match extension.schema_uri.as_deref() {
                Some(uri) => {
                    let location = document.location.resolve_relative(uri)?;
                    let schema_key = CacheKey::schema_uri(&location.identity());
                    cache.get_or_load(schema_key.clone(), keep_resident, |inner| {
                        Ok(SchemaLoader::from_uri(schema_key, location, inner.fetcher()))
                    })?
                }
                None => {
                    // inline schemas dedup by content hash
                    let mut hasher = DefaultHasher::new();
                    raw.get("schema")
                        .map(|schema| schema.to_string())
                        .unwrap_or_default()
                        .hash(&mut hasher);
                    let schema_key = CacheKey::schema_inline(hasher.finish());
                    let inline = extension.schema.clone().unwrap_or_default();
                    cache.get_or_load(schema_key.clone(), keep_resident, |_| {
                        Ok(SchemaLoader::inline(schema_key, inline))
                    })?
                }
            };

            let mut views = HashMap::new();
            for table in extension.feature_tables.values() {
                for property in table.properties.values() {
                    if !views.contains_key(&property.buffer_view) {
                        let view =
                            cache.load_buffer_view(document, property.buffer_view, keep_resident)?;
                        views.insert(property.buffer_view, view);
                    }
                }
            }

            let mut textures = HashMap::new();
            for texture in extension.feature_textures.values() {
                for property in texture.properties.values() {
                    let index = property.texture.index;
                    if !textures.contains_key(&index) {
                        let handle = cache.load_texture(document, index, options)?;
                        textures.insert(index, handle);
                    }
                }
            }

            Ok(FeatureMetadataLoader::new(
                key,
                extension,
                schema,
                views,
                textures,
            ))
        })
    }

    fn load_gltf_json(
        &mut self,
        location: DataLocation,
        keep_resident: bool,
    ) -> Result<ResourceHandle<GltfJsonLoader>, ResourceError> {
        let key = CacheKey::gltf(&location.identity());
        self.get_or_load(key.clone(), keep_resident, |cache| {
            Ok(GltfJsonLoader::new(
                key,
                location,
                cache.fetcher(),
                keep_resident,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_cache::fetch::MemoryFetcher;
    use lode_cache::ResourceLoader;

    #[tokio::test]
    async fn buffer_requests_for_one_uri_share_a_loader() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://shared.bin", Bytes::from_static(&[9u8; 16]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));

        let a = cache
            .load_external_buffer(DataLocation::Url("mem://shared.bin".into()), false)
            .expect("first");
        let b = cache
            .load_external_buffer(DataLocation::Url("mem://shared.bin".into()), false)
            .expect("second");
        assert!(Arc::ptr_eq(a.loader(), b.loader()));
        cache.maintain();
        assert_eq!(
            cache.ref_count(&CacheKey::external_buffer("mem://shared.bin")),
            Some(2)
        );
    }

    #[tokio::test]
    async fn equal_length_blobs_keep_distinct_loaders() {
        let mut cache = ResourceCache::new(Arc::new(MemoryFetcher::new()));
        let a = cache
            .load_external_buffer(DataLocation::Blob(Bytes::from_static(b"AAAA")), false)
            .expect("a");
        let b = cache
            .load_external_buffer(DataLocation::Blob(Bytes::from_static(b"BBBB")), false)
            .expect("b");
        assert!(!Arc::ptr_eq(a.loader(), b.loader()));

        a.signal().settled().await.expect("a ready");
        b.signal().settled().await.expect("b ready");
        assert_eq!(&a.bytes().expect("a bytes")[..], b"AAAA");
        assert_eq!(&b.bytes().expect("b bytes")[..], b"BBBB");
    }

    #[tokio::test]
    async fn embedded_buffers_from_different_documents_do_not_collide() {
        let mut cache = ResourceCache::new(Arc::new(MemoryFetcher::new()));
        let a = cache
            .load_embedded_buffer("a.glb", 0, Bytes::from_static(&[1]), false)
            .expect("a");
        let b = cache
            .load_embedded_buffer("b.glb", 0, Bytes::from_static(&[2]), false)
            .expect("b");
        assert!(!Arc::ptr_eq(a.loader(), b.loader()));
    }
}
