use crate::buffer_view::BufferViewLoader;
use crate::texture::TextureLoader;
use bytes::Bytes;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::fetch::{DataLocation, Fetcher};
use lode_cache::frame::FrameContext;
use lode_cache::gpu::GpuTexture;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use serde::Deserialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Element type of a metadata property column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetadataType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Boolean,
    String,
    Enum,
    Array,
}

impl MetadataType {
    /// Fixed element size, `None` for variable-width kinds.
    pub fn size_in_bytes(&self) -> Option<usize> {
        match self {
            MetadataType::Int8 | MetadataType::Uint8 | MetadataType::Boolean => Some(1),
            MetadataType::Int16 | MetadataType::Uint16 => Some(2),
            MetadataType::Int32 | MetadataType::Uint32 | MetadataType::Float32 => Some(4),
            MetadataType::Int64 | MetadataType::Uint64 | MetadataType::Float64 => Some(8),
            MetadataType::String | MetadataType::Enum | MetadataType::Array => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassProperty {
    #[serde(rename = "type")]
    pub property_type: MetadataType,
    #[serde(rename = "componentCount")]
    pub component_count: Option<usize>,
    #[serde(default)]
    pub normalized: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataClass {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, ClassProperty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataSchema {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub classes: HashMap<String, MetadataClass>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureTableProperty {
    #[serde(rename = "bufferView")]
    pub buffer_view: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureTable {
    pub class: String,
    pub count: usize,
    #[serde(default)]
    pub properties: HashMap<String, FeatureTableProperty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataTextureInfo {
    pub index: usize,
    #[serde(rename = "texCoord", default)]
    pub tex_coord: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureTextureProperty {
    pub channels: String,
    pub texture: MetadataTextureInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureTexture {
    pub class: String,
    #[serde(default)]
    pub properties: HashMap<String, FeatureTextureProperty>,
}

/// Raw shape of the feature-metadata extension object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureMetadataExtension {
    pub schema: Option<MetadataSchema>,
    #[serde(rename = "schemaUri")]
    pub schema_uri: Option<String>,
    #[serde(rename = "featureTables", default)]
    pub feature_tables: HashMap<String, FeatureTable>,
    #[serde(rename = "featureTextures", default)]
    pub feature_textures: HashMap<String, FeatureTexture>,
}

enum SchemaSource {
    Inline(Arc<MetadataSchema>),
    Uri {
        location: DataLocation,
        fetcher: Arc<dyn Fetcher>,
    },
}

#[derive(Default)]
struct SchemaInner {
    schema: Option<Arc<MetadataSchema>>,
}

/// Cache entry for a metadata schema, inline or fetched by URI. Inline
/// schemas are `Ready` as soon as `load` runs.
pub struct SchemaLoader {
    core: LoaderCore,
    source: SchemaSource,
    inner: Mutex<SchemaInner>,
}

impl SchemaLoader {
    pub fn inline(key: CacheKey, schema: MetadataSchema) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            source: SchemaSource::Inline(Arc::new(schema)),
            inner: Mutex::new(SchemaInner::default()),
        })
    }

    pub fn from_uri(key: CacheKey, location: DataLocation, fetcher: Arc<dyn Fetcher>) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            source: SchemaSource::Uri { location, fetcher },
            inner: Mutex::new(SchemaInner::default()),
        })
    }

    pub fn schema(&self) -> Option<Arc<MetadataSchema>> {
        self.inner.lock().unwrap().schema.clone()
    }
}

impl ResourceLoader for SchemaLoader {
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
        match &self.source {
            SchemaSource::Inline(schema) => {
                self.inner.lock().unwrap().schema = Some(schema.clone());
                self.core.finish();
            }
            SchemaSource::Uri { location, fetcher } => {
                let loader = self.clone();
                let location = location.clone();
                let fetcher = fetcher.clone();
                tokio::spawn(async move {
                    let parsed = match fetcher.fetch(&location).await {
                        Ok(bytes) => serde_json::from_slice::<MetadataSchema>(&bytes)
                            .map_err(|e| ResourceError::format(location.identity(), e)),
                        Err(error) => Err(error),
                    };
                    let mut inner = loader.inner.lock().unwrap();
                    if loader.core.is_destroyed() {
                        return;
                    }
                    match parsed {
                        Ok(schema) => {
                            inner.schema = Some(Arc::new(schema));
                            drop(inner);
                            loader.core.finish();
                        }
                        Err(error) => {
                            drop(inner);
                            loader
                                .core
                                .fail(ResourceError::dependency("Failed to load schema", error));
                        }
                    }
                });
            }
        }
    }

    fn update(&self, _frame: &mut FrameContext<'_>) {}

    fn destroy(&self) {
        if self.core.destroy() {
            self.inner.lock().unwrap().schema = None;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// One bufferView-backed property column. The bytes are shared with the
/// owning buffer view, never copied.
#[derive(Debug, Clone)]
pub struct MetadataColumn {
    pub property_type: MetadataType,
    pub component_count: usize,
    pub data: Bytes,
}

impl MetadataColumn {
    /// Reinterpret the column as a slice of `T`. `None` when the byte length
    /// or alignment does not fit.
    pub fn typed<T: bytemuck::Pod>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(self.data.as_ref()).ok()
    }
}

#[derive(Debug, Clone)]
pub struct MetadataTable {
    pub class: String,
    pub count: usize,
    pub columns: HashMap<String, MetadataColumn>,
}

#[derive(Debug, Clone)]
pub struct MetadataTextureProperty {
    pub channels: String,
    pub tex_coord: u32,
    pub texture: GpuTexture,
}

#[derive(Debug, Clone)]
pub struct MetadataTexture {
    pub class: String,
    pub properties: HashMap<String, MetadataTextureProperty>,
}

/// Assembled semantic view over one feature-metadata extension.
#[derive(Debug, Clone, Default)]
pub struct MetadataGltfExtension {
    pub schema: Arc<MetadataSchema>,
    pub tables: HashMap<String, MetadataTable>,
    pub textures: HashMap<String, MetadataTexture>,
}

struct Inner {
    schema: Option<ResourceHandle<SchemaLoader>>,
    views: HashMap<usize, ResourceHandle<BufferViewLoader>>,
    textures: HashMap<usize, ResourceHandle<TextureLoader>>,
    result: Option<Arc<MetadataGltfExtension>>,
}

/// Waits on the schema plus the distinct buffer views and textures an
/// extension references, then builds `MetadataGltfExtension`. Dependency
/// handles stay held so the backing bytes and GPU textures outlive the view.
pub struct FeatureMetadataLoader {
    core: LoaderCore,
    extension: FeatureMetadataExtension,
    inner: Mutex<Inner>,
}

impl FeatureMetadataLoader {
    /// `views` and `textures` are the de-duplicated unions of everything the
    /// extension references, keyed by bufferView and texture index.
    pub fn new(
        key: CacheKey,
        extension: FeatureMetadataExtension,
        schema: ResourceHandle<SchemaLoader>,
        views: HashMap<usize, ResourceHandle<BufferViewLoader>>,
        textures: HashMap<usize, ResourceHandle<TextureLoader>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            extension,
            inner: Mutex::new(Inner {
                schema: Some(schema),
                views,
                textures,
                result: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The assembled metadata view, available once `Ready`.
    pub fn metadata(&self) -> Option<Arc<MetadataGltfExtension>> {
        self.inner().result.clone()
    }

    fn fail_and_release(&self, error: ResourceError) {
        {
            let mut inner = self.inner();
            inner.schema = None;
            inner.views.clear();
            inner.textures.clear();
        }
        self.core.fail(ResourceError::dependency(
            "Failed to load feature metadata",
            error,
        ));
    }

    fn assemble(&self, inner: &Inner) -> Result<MetadataGltfExtension, ResourceError> {
        let schema = inner
            .schema
            .as_ref()
            .and_then(|s| s.schema())
            .ok_or(ResourceError::Destroyed)?;

        let mut tables = HashMap::new();
        for (name, table) in &self.extension.feature_tables {
            let class = schema.classes.get(&table.class).ok_or_else(|| {
                ResourceError::format(
                    "Failed to load feature metadata",
                    format!("feature table {name} references unknown class {}", table.class),
                )
            })?;
            let mut columns = HashMap::new();
            for (property, source) in &table.properties {
                let declared = class.properties.get(property).ok_or_else(|| {
                    ResourceError::format(
                        "Failed to load feature metadata",
                        format!("class {} has no property {property}", table.class),
                    )
                })?;
                let data = inner
                    .views
                    .get(&source.buffer_view)
                    .and_then(|view| view.bytes())
                    .ok_or(ResourceError::Destroyed)?;
                columns.insert(
                    property.clone(),
                    MetadataColumn {
                        property_type: declared.property_type,
                        component_count: declared.component_count.unwrap_or(1),
                        data,
                    },
                );
            }
            tables.insert(
                name.clone(),
                MetadataTable {
                    class: table.class.clone(),
                    count: table.count,
                    columns,
                },
            );
        }

        let mut textures = HashMap::new();
        for (name, texture) in &self.extension.feature_textures {
            let mut properties = HashMap::new();
            for (property, source) in &texture.properties {
                let gpu = inner
                    .textures
                    .get(&source.texture.index)
                    .and_then(|t| t.gpu_texture())
                    .ok_or(ResourceError::Destroyed)?;
                properties.insert(
                    property.clone(),
                    MetadataTextureProperty {
                        channels: source.channels.clone(),
                        tex_coord: source.texture.tex_coord,
                        texture: gpu,
                    },
                );
            }
            textures.insert(
                name.clone(),
                MetadataTexture {
                    class: texture.class.clone(),
                    properties,
                },
            );
        }

        Ok(MetadataGltfExtension {
            schema,
            tables,
            textures,
        })
    }
}

impl ResourceLoader for FeatureMetadataLoader {
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
        if self.state() != ResourceLoaderState::Loading {
            return;
        }

        // textures need frame-driven GPU uploads
        let texture_loaders: Vec<Arc<TextureLoader>> = self
            .inner()
            .textures
            .values()
            .map(|handle| handle.loader().clone())
            .collect();
        for texture in texture_loaders {
            texture.update(frame);
        }

        let mut signals: Vec<LoadSignal> = Vec::new();
        {
            let inner = self.inner();
            match inner.schema.as_ref() {
                Some(schema) => signals.push(schema.signal()),
                None => return,
            }
            signals.extend(inner.views.values().map(|view| view.signal()));
            signals.extend(inner.textures.values().map(|texture| texture.signal()));
        }

        let mut pending = false;
        for signal in &signals {
            match signal.try_result() {
                None => pending = true,
                Some(Err(error)) => {
                    self.fail_and_release(error);
                    return;
                }
                Some(Ok(())) => {}
            }
        }
        if pending {
            return;
        }

        let mut inner = self.inner();
        match self.assemble(&inner) {
            Ok(metadata) => {
                inner.result = Some(Arc::new(metadata));
                drop(inner);
                self.core.finish();
            }
            Err(error) => {
                drop(inner);
                self.fail_and_release(error);
            }
        }
    }

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.schema = None;
            inner.views.clear();
            inner.textures.clear();
            inner.result = None;
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
    use lode_cache::fetch::MemoryFetcher;
    use lode_cache::gpu::RecordingGpu;

    fn id_schema() -> MetadataSchema {
        serde_json::from_str(
            r#"{
                "classes": {
                    "building": {
                        "properties": {
                            "height": { "type": "FLOAT32" },
                            "id": { "type": "UINT32" }
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn extension_json_parses() {
        let extension: FeatureMetadataExtension = serde_json::from_str(
            r#"{
                "schemaUri": "schema.json",
                "featureTables": {
                    "buildings": {
                        "class": "building",
                        "count": 10,
                        "properties": { "height": { "bufferView": 2 } }
                    }
                },
                "featureTextures": {
                    "materials": {
                        "class": "material",
                        "properties": {
                            "kind": { "channels": "r", "texture": { "index": 0, "texCoord": 1 } }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(extension.schema_uri.as_deref(), Some("schema.json"));
        assert_eq!(extension.feature_tables["buildings"].count, 10);
        let texture = &extension.feature_textures["materials"].properties["kind"];
        assert_eq!(texture.channels, "r");
        assert_eq!(texture.texture.tex_coord, 1);
    }

    #[test]
    fn metadata_type_sizes() {
        assert_eq!(MetadataType::Uint8.size_in_bytes(), Some(1));
        assert_eq!(MetadataType::Float64.size_in_bytes(), Some(8));
        assert_eq!(MetadataType::String.size_in_bytes(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schema_loader_fetches_and_parses() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert(
            "mem://schema.json",
            Bytes::from(serde_json::to_vec(&serde_json::json!({
                "classes": { "building": { "properties": { "height": { "type": "FLOAT32" } } } }
            })).unwrap()),
        );
        let cache = ResourceCache::new(Arc::new(fetcher));
        let loader = SchemaLoader::from_uri(
            CacheKey::schema_uri("mem://schema.json"),
            DataLocation::Url("mem://schema.json".into()),
            cache.fetcher(),
        );
        loader.clone().load();
        loader.signal().settled().await.expect("schema ready");
        let schema = loader.schema().expect("schema");
        assert!(schema.classes.contains_key("building"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn table_columns_reference_buffer_view_bytes() {
        let heights: Vec<u8> = [1.0f32, 2.5, 4.0]
            .iter()
            .flat_map(|h| h.to_le_bytes())
            .collect();
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://meta.bin", Bytes::from(heights));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();

        let parent = cache
            .load_external_buffer(DataLocation::Url("mem://meta.bin".into()), false)
            .expect("parent");
        let view_key = CacheKey::buffer_view("doc", 2);
        let view = cache
            .get_or_load(view_key.clone(), false, |_| {
                Ok(BufferViewLoader::new(view_key.clone(), parent.clone(), 0, 12))
            })
            .expect("view");
        cache.release(parent);

        let schema_key = CacheKey::schema_inline(1);
        let schema = cache
            .get_or_load(schema_key.clone(), false, |_| {
                Ok(SchemaLoader::inline(schema_key.clone(), id_schema()))
            })
            .expect("schema");
        schema.loader().clone().load();

        let extension: FeatureMetadataExtension = serde_json::from_str(
            r#"{
                "featureTables": {
                    "buildings": {
                        "class": "building",
                        "count": 3,
                        "properties": { "height": { "bufferView": 2 } }
                    }
                }
            }"#,
        )
        .unwrap();
        let loader = FeatureMetadataLoader::new(
            CacheKey::feature_metadata("doc"),
            extension,
            schema,
            HashMap::from([(2usize, view)]),
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
        assert_eq!(loader.state(), ResourceLoaderState::Ready);
        let metadata = loader.metadata().expect("metadata");
        let column = &metadata.tables["buildings"].columns["height"];
        assert_eq!(column.property_type, MetadataType::Float32);
        assert_eq!(column.typed::<f32>(), Some(&[1.0f32, 2.5, 4.0][..]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_class_fails_assembly() {
        let mut fetcher = MemoryFetcher::new();
        fetcher.insert("mem://meta2.bin", Bytes::from_static(&[0u8; 4]));
        let mut cache = ResourceCache::new(Arc::new(fetcher));
        let mut gpu = RecordingGpu::new();

        let parent = cache
            .load_external_buffer(DataLocation::Url("mem://meta2.bin".into()), false)
            .expect("parent");
        let view_key = CacheKey::buffer_view("doc2", 0);
        let view = cache
            .get_or_load(view_key.clone(), false, |_| {
                Ok(BufferViewLoader::new(view_key.clone(), parent.clone(), 0, 4))
            })
            .expect("view");
        cache.release(parent);

        let schema_key = CacheKey::schema_inline(2);
        let schema = cache
            .get_or_load(schema_key.clone(), false, |_| {
                Ok(SchemaLoader::inline(schema_key.clone(), MetadataSchema::default()))
            })
            .expect("schema");
        schema.loader().clone().load();

        let extension: FeatureMetadataExtension = serde_json::from_str(
            r#"{
                "featureTables": {
                    "ghosts": {
                        "class": "missing",
                        "count": 1,
                        "properties": { "x": { "bufferView": 0 } }
                    }
                }
            }"#,
        )
        .unwrap();
        let loader = FeatureMetadataLoader::new(
            CacheKey::feature_metadata("doc2"),
            extension,
            schema,
            HashMap::from([(0usize, view)]),
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
        assert!(matches!(
            loader.signal().settled().await,
            Err(ResourceError::Dependency { .. })
        ));
    }
}
