use crate::cache_ext::GltfCacheExt;
use crate::draco::DracoExtension;
use crate::format::{component_count, ComponentType};
use crate::json::{GltfDocument, GltfJsonLoader};
use crate::metadata::{FeatureMetadataLoader, MetadataTextureInfo};
use crate::model::{
    AttributeSource, FeatureIdAttribute, FeatureIdTexture, Indices, Instances, Material, Mesh,
    ModelComponents, MorphTarget, Node, Primitive, TextureRef, VertexAttribute,
};
use lode_cache::cache::{ResourceCache, ResourceHandle};
use lode_cache::error::ResourceError;
use lode_cache::fetch::DataLocation;
use lode_cache::frame::FrameContext;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use crate::options::GltfLoadOptions;
use serde::Deserialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

const EXT_DRACO: &str = "KHR_draco_mesh_compression";
const EXT_INSTANCING: &str = "EXT_mesh_gpu_instancing";
const EXT_FEATURE_METADATA: &str = "EXT_feature_metadata";
const EXT_SPECULAR_GLOSSINESS: &str = "KHR_materials_pbrSpecularGlossiness";

#[derive(Debug, Default, Deserialize)]
struct PrimitiveMetadataExt {
    #[serde(rename = "featureIdAttributes", default)]
    feature_id_attributes: Vec<FeatureIdAttributeJson>,
    #[serde(rename = "featureIdTextures", default)]
    feature_id_textures: Vec<FeatureIdTextureJson>,
}

#[derive(Debug, Deserialize)]
struct FeatureIdAttributeJson {
    #[serde(rename = "featureTable")]
    feature_table: String,
    #[serde(rename = "featureIds", default)]
    feature_ids: AttributeFeatureIds,
}

#[derive(Debug, Default, Deserialize)]
struct AttributeFeatureIds {
    attribute: Option<String>,
    #[serde(default)]
    constant: u64,
    #[serde(default)]
    divisor: u64,
}

#[derive(Debug, Deserialize)]
struct FeatureIdTextureJson {
    #[serde(rename = "featureTable")]
    feature_table: String,
    #[serde(rename = "featureIds")]
    feature_ids: TextureFeatureIds,
}

#[derive(Debug, Deserialize)]
struct TextureFeatureIds {
    channels: String,
    texture: MetadataTextureInfo,
}

#[derive(Debug, Default, Deserialize)]
struct InstancingExt {
    #[serde(default)]
    attributes: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct TextureInfoJson {
    index: usize,
    #[serde(rename = "texCoord", default)]
    tex_coord: u32,
}

#[derive(Debug, Default, Deserialize)]
struct SpecularGlossinessExt {
    #[serde(rename = "diffuseTexture")]
    diffuse_texture: Option<TextureInfoJson>,
    #[serde(rename = "specularGlossinessTexture")]
    specular_glossiness_texture: Option<TextureInfoJson>,
}

fn semantic_name(semantic: &gltf::Semantic) -> String {
    match semantic {
        gltf::Semantic::Positions => "POSITION".into(),
        gltf::Semantic::Normals => "NORMAL".into(),
        gltf::Semantic::Tangents => "TANGENT".into(),
        gltf::Semantic::Colors(set) => format!("COLOR_{set}"),
        gltf::Semantic::TexCoords(set) => format!("TEXCOORD_{set}"),
        gltf::Semantic::Joints(set) => format!("JOINTS_{set}"),
        gltf::Semantic::Weights(set) => format!("WEIGHTS_{set}"),
        gltf::Semantic::Extras(name) => format!("_{name}"),
    }
}

struct Inner {
    json: Option<ResourceHandle<GltfJsonLoader>>,
    building: Option<ModelComponents>,
    metadata: Option<ResourceHandle<FeatureMetadataLoader>>,
    result: Option<Arc<ModelComponents>>,
}

/// Top-level orchestrator: loads the document through the cache, walks the
/// scene graph once issuing one loader per attribute, index stream, texture
/// and metadata extension, then drives them every frame until the whole tree
/// settles.
///
/// Not itself a cache entry; the owning model drops it to release everything
/// it acquired.
pub struct GltfLoader {
    core: LoaderCore,
    identity: String,
    options: GltfLoadOptions,
    inner: Mutex<Inner>,
}

impl GltfLoader {
    pub fn new(
        cache: &mut ResourceCache,
        location: DataLocation,
        options: GltfLoadOptions,
    ) -> Result<Arc<Self>, ResourceError> {
        let identity = location.identity();
        let json = cache.load_gltf_json(location, options.keep_resident)?;
        Ok(Arc::new(Self {
            core: LoaderCore::new(CacheKey::gltf(&identity)),
            identity,
            options,
            inner: Mutex::new(Inner {
                json: Some(json),
                building: None,
                metadata: None,
                result: None,
            }),
        }))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The loaded model, available once `Ready`.
    pub fn components(&self) -> Option<Arc<ModelComponents>> {
        self.inner().result.clone()
    }

    fn fail_and_release(&self, error: ResourceError) {
        {
            let mut inner = self.inner();
            inner.json = None;
            inner.building = None;
            inner.metadata = None;
        }
        self.core.fail(ResourceError::dependency(
            format!("Failed to load glTF: {}", self.identity),
            error,
        ));
    }

    fn primitive_extension<'a>(
        document: &'a GltfDocument,
        mesh_index: usize,
        primitive_index: usize,
        name: &str,
    ) -> Option<&'a serde_json::Value> {
        document
            .root
            .meshes
            .get(mesh_index)?
            .primitives
            .get(primitive_index)?
            .extensions
            .as_ref()?
            .others
            .get(name)
    }

    fn node_extension<'a>(
        document: &'a GltfDocument,
        node_index: usize,
        name: &str,
    ) -> Option<&'a serde_json::Value> {
        document
            .root
            .nodes
            .get(node_index)?
            .extensions
            .as_ref()?
            .others
            .get(name)
    }

    fn material_extension<'a>(
        document: &'a GltfDocument,
        material_index: usize,
        name: &str,
    ) -> Option<&'a serde_json::Value> {
        document
            .root
            .materials
            .get(material_index)?
            .extensions
            .as_ref()?
            .others
            .get(name)
    }

    fn attribute_from_accessor(
        &self,
        frame: &mut FrameContext<'_>,
        document: &Arc<GltfDocument>,
        semantic: String,
        accessor: &gltf::Accessor<'_>,
        draco: Option<&DracoExtension>,
    ) -> Result<VertexAttribute, ResourceError> {
        let source = match draco {
            Some(ext) if ext.attributes.contains_key(&semantic) => {
                let decoder = self.options.draco_decoder.clone().ok_or_else(|| {
                    ResourceError::format(
                        self.identity.clone(),
                        "document uses Draco compression but no decoder is configured",
                    )
                })?;
                AttributeSource::Buffer(frame.cache.load_vertex_buffer_draco(
                    document,
                    ext,
                    &semantic,
                    decoder,
                    &self.options,
                )?)
            }
            _ => match accessor.view() {
                // all-default accessor, nothing to load
                None => AttributeSource::Constant(0.0),
                Some(_) => AttributeSource::Buffer(frame.cache.load_vertex_buffer(
                    document,
                    accessor,
                    &self.options,
                )?),
            },
        };
        Ok(VertexAttribute {
            semantic,
            component_type: ComponentType::from(accessor.data_type()),
            components: component_count(accessor.dimensions()),
            count: accessor.count(),
            normalized: accessor.normalized(),
            source,
            gpu: None,
        })
    }

    fn texture_ref(
        &self,
        frame: &mut FrameContext<'_>,
        document: &Arc<GltfDocument>,
        texture_index: usize,
        tex_coord: u32,
    ) -> Result<TextureRef, ResourceError> {
        let loader = frame
            .cache
            .load_texture(document, texture_index, &self.options)?;
        let sampler = loader.sampler();
        Ok(TextureRef {
            loader,
            tex_coord,
            sampler,
            gpu: None,
        })
    }

    fn build_material(
        &self,
        frame: &mut FrameContext<'_>,
        document: &Arc<GltfDocument>,
        material: &gltf::Material<'_>,
    ) -> Result<Material, ResourceError> {
        let mut built = Material::default();
        let pbr = material.pbr_metallic_roughness();
        if let Some(info) = pbr.base_color_texture() {
            built.base_color =
                Some(self.texture_ref(frame, document, info.texture().index(), info.tex_coord())?);
        }
        if let Some(info) = pbr.metallic_roughness_texture() {
            built.metallic_roughness =
                Some(self.texture_ref(frame, document, info.texture().index(), info.tex_coord())?);
        }
        if let Some(index) = material.index() {
            if let Some(raw) = Self::material_extension(document, index, EXT_SPECULAR_GLOSSINESS) {
                let ext: SpecularGlossinessExt = serde_json::from_value(raw.clone())
                    .map_err(|e| ResourceError::format(self.identity.clone(), e))?;
                if let Some(info) = ext.diffuse_texture {
                    built.diffuse =
                        Some(self.texture_ref(frame, document, info.index, info.tex_coord)?);
                }
                if let Some(info) = ext.specular_glossiness_texture {
                    built.specular_glossiness =
                        Some(self.texture_ref(frame, document, info.index, info.tex_coord)?);
                }
            }
        }
        if let Some(info) = material.emissive_texture() {
            built.emissive =
                Some(self.texture_ref(frame, document, info.texture().index(), info.tex_coord())?);
        }
        if let Some(normal) = material.normal_texture() {
            built.normal = Some(self.texture_ref(
                frame,
                document,
                normal.texture().index(),
                normal.tex_coord(),
            )?);
        }
        if let Some(occlusion) = material.occlusion_texture() {
            built.occlusion = Some(self.texture_ref(
                frame,
                document,
                occlusion.texture().index(),
                occlusion.tex_coord(),
            )?);
        }
        Ok(built)
    }

    fn build_primitive(
        &self,
        frame: &mut FrameContext<'_>,
        document: &Arc<GltfDocument>,
        mesh_index: usize,
        primitive: &gltf::Primitive<'_>,
    ) -> Result<Primitive, ResourceError> {
        let draco = match Self::primitive_extension(document, mesh_index, primitive.index(), EXT_DRACO)
        {
            Some(raw) => Some(
                serde_json::from_value::<DracoExtension>(raw.clone())
                    .map_err(|e| ResourceError::format(self.identity.clone(), e))?,
            ),
            None => None,
        };

        let mut attributes = Vec::new();
        for (semantic, accessor) in primitive.attributes() {
            attributes.push(self.attribute_from_accessor(
                frame,
                document,
                semantic_name(&semantic),
                &accessor,
                draco.as_ref(),
            )?);
        }

        // morph targets never go through Draco, even when the primitive does
        let mut morph_targets = Vec::new();
        for target in primitive.morph_targets() {
            let accessors = [
                ("POSITION", target.positions()),
                ("NORMAL", target.normals()),
                ("TANGENT", target.tangents()),
            ];
            for (semantic, accessor) in accessors {
                if let Some(accessor) = accessor {
                    morph_targets.push(MorphTarget {
                        semantic: semantic.to_owned(),
                        attribute: self.attribute_from_accessor(
                            frame,
                            document,
                            semantic.to_owned(),
                            &accessor,
                            None,
                        )?,
                    });
                }
            }
        }

        let indices = match (primitive.indices(), draco.as_ref()) {
            (Some(accessor), Some(ext)) => {
                let decoder = self.options.draco_decoder.clone().ok_or_else(|| {
                    ResourceError::format(
                        self.identity.clone(),
                        "document uses Draco compression but no decoder is configured",
                    )
                })?;
                Some(Indices {
                    loader: frame.cache.load_index_buffer_draco(
                        document,
                        ext,
                        &accessor,
                        decoder,
                        &self.options,
                    )?,
                    gpu: None,
                })
            }
            (Some(accessor), None) => Some(Indices {
                loader: frame
                    .cache
                    .load_index_buffer(document, &accessor, &self.options)?,
                gpu: None,
            }),
            (None, _) => None,
        };

        let material = self.build_material(frame, document, &primitive.material())?;

        let mut feature_id_attributes = Vec::new();
        let mut feature_id_textures = Vec::new();
        if let Some(raw) =
            Self::primitive_extension(document, mesh_index, primitive.index(), EXT_FEATURE_METADATA)
        {
            let ext: PrimitiveMetadataExt = serde_json::from_value(raw.clone())
                .map_err(|e| ResourceError::format(self.identity.clone(), e))?;
            for declared in ext.feature_id_attributes {
                feature_id_attributes.push(FeatureIdAttribute {
                    feature_table: declared.feature_table,
                    attribute: declared.feature_ids.attribute,
                    constant: declared.feature_ids.constant,
                    divisor: declared.feature_ids.divisor,
                });
            }
            for declared in ext.feature_id_textures {
                feature_id_textures.push(FeatureIdTexture {
                    feature_table: declared.feature_table,
                    channels: declared.feature_ids.channels,
                    texture: self.texture_ref(
                        frame,
                        document,
                        declared.feature_ids.texture.index,
                        declared.feature_ids.texture.tex_coord,
                    )?,
                });
            }
        }

        Ok(Primitive {
            attributes,
            morph_targets,
            indices,
            material,
            feature_id_attributes,
            feature_id_textures,
        })
    }

    fn build_node(
        &self,
        frame: &mut FrameContext<'_>,
        document: &Arc<GltfDocument>,
        node: &gltf::Node<'_>,
    ) -> Result<Node, ResourceError> {
        let mesh = match node.mesh() {
            Some(mesh) => {
                let mut primitives = Vec::new();
                for primitive in mesh.primitives() {
                    primitives.push(self.build_primitive(frame, document, mesh.index(), &primitive)?);
                }
                Some(Mesh { primitives })
            }
            None => None,
        };

        let instances = match Self::node_extension(document, node.index(), EXT_INSTANCING) {
            Some(raw) => {
                let ext: InstancingExt = serde_json::from_value(raw.clone())
                    .map_err(|e| ResourceError::format(self.identity.clone(), e))?;
                let mut attributes = Vec::new();
                let mut count = 0;
                for (semantic, accessor_index) in ext.attributes {
                    let accessor =
                        document.document.accessors().nth(accessor_index).ok_or_else(|| {
                            ResourceError::format(
                                self.identity.clone(),
                                format!("instancing references missing accessor {accessor_index}"),
                            )
                        })?;
                    count = accessor.count();
                    attributes.push(self.attribute_from_accessor(
                        frame, document, semantic, &accessor, None,
                    )?);
                }
                Some(Instances { attributes, count })
            }
            None => None,
        };

        let mut children = Vec::new();
        for child in node.children() {
            children.push(self.build_node(frame, document, &child)?);
        }

        Ok(Node {
            children,
            mesh,
            instances,
            transform: glam::Mat4::from_cols_array_2d(&node.transform().matrix()),
        })
    }

    /// One top-down walk issuing every child loader the model needs.
    fn build_components(
        &self,
        frame: &mut FrameContext<'_>,
        document: &Arc<GltfDocument>,
    ) -> Result<(ModelComponents, Option<ResourceHandle<FeatureMetadataLoader>>), ResourceError>
    {
        let mut scene_nodes = Vec::new();
        let scene = document
            .document
            .default_scene()
            .or_else(|| document.document.scenes().next());
        if let Some(scene) = scene {
            for node in scene.nodes() {
                scene_nodes.push(self.build_node(frame, document, &node)?);
            }
        }

        let metadata = match document.root_extension(EXT_FEATURE_METADATA) {
            Some(raw) => {
                let raw = raw.clone();
                Some(
                    frame
                        .cache
                        .load_feature_metadata(document, &raw, &self.options)?,
                )
            }
            None => None,
        };

        Ok((
            ModelComponents {
                scene: scene_nodes,
                feature_metadata: None,
            },
            metadata,
        ))
    }

    fn drive_attribute(
        attribute: &mut VertexAttribute,
        frame: &mut FrameContext<'_>,
    ) -> Result<bool, ResourceError> {
        let AttributeSource::Buffer(handle) = &attribute.source else {
            return Ok(false);
        };
        let loader = handle.loader().clone();
        loader.update(frame);
        match handle.signal().try_result() {
            None => Ok(true),
            Some(Err(error)) => Err(error),
            Some(Ok(())) => {
                attribute.gpu = loader.gpu_buffer();
                Ok(false)
            }
        }
    }

    fn drive_texture(
        texture: &mut TextureRef,
        frame: &mut FrameContext<'_>,
    ) -> Result<bool, ResourceError> {
        let loader = texture.loader.loader().clone();
        loader.update(frame);
        match texture.loader.signal().try_result() {
            None => Ok(true),
            Some(Err(error)) => Err(error),
            Some(Ok(())) => {
                texture.gpu = loader.gpu_texture();
                Ok(false)
            }
        }
    }

    fn drive_node(node: &mut Node, frame: &mut FrameContext<'_>) -> Result<bool, ResourceError> {
        let mut pending = false;
        if let Some(mesh) = node.mesh.as_mut() {
            for primitive in &mut mesh.primitives {
                for attribute in &mut primitive.attributes {
                    pending |= Self::drive_attribute(attribute, frame)?;
                }
                for target in &mut primitive.morph_targets {
                    pending |= Self::drive_attribute(&mut target.attribute, frame)?;
                }
                if let Some(indices) = primitive.indices.as_mut() {
                    let loader = indices.loader.loader().clone();
                    loader.update(frame);
                    match indices.loader.signal().try_result() {
                        None => pending = true,
                        Some(Err(error)) => return Err(error),
                        Some(Ok(())) => indices.gpu = loader.gpu_buffer(),
                    }
                }
                for texture in primitive.material.textures_mut() {
                    pending |= Self::drive_texture(texture, frame)?;
                }
                for feature in &mut primitive.feature_id_textures {
                    pending |= Self::drive_texture(&mut feature.texture, frame)?;
                }
            }
        }
        if let Some(instances) = node.instances.as_mut() {
            for attribute in &mut instances.attributes {
                pending |= Self::drive_attribute(attribute, frame)?;
            }
        }
        for child in &mut node.children {
            pending |= Self::drive_node(child, frame)?;
        }
        Ok(pending)
    }
}

impl ResourceLoader for GltfLoader {
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
                let json = match self.inner().json.clone() {
                    Some(json) => json,
                    None => return,
                };
                json.loader().clone().update(frame);
                match json.signal().try_result() {
                    None => {}
                    Some(Err(error)) => self.fail_and_release(error),
                    Some(Ok(())) => {
                        let Some(document) = json.loader().document() else {
                            return;
                        };
                        if !self.core.begin_processing() {
                            return;
                        }
                        match self.build_components(frame, &document) {
                            Ok((components, metadata)) => {
                                let mut inner = self.inner();
                                if self.core.is_destroyed() {
                                    return;
                                }
                                inner.building = Some(components);
                                inner.metadata = metadata;
                                // the walk is done; children hold their own
                                // references to whatever they still need
                                inner.json = None;
                            }
                            Err(error) => self.fail_and_release(error),
                        }
                    }
                }
            }
            ResourceLoaderState::Processing => {
                let mut inner = self.inner();
                let Some(mut components) = inner.building.take() else {
                    return;
                };
                let metadata = inner.metadata.take();
                drop(inner);

                let mut pending = false;
                let mut failed = None;
                for node in &mut components.scene {
                    match Self::drive_node(node, frame) {
                        Ok(node_pending) => pending |= node_pending,
                        Err(error) => {
                            failed = Some(error);
                            break;
                        }
                    }
                }
                if failed.is_none() {
                    if let Some(handle) = metadata.as_ref() {
                        let loader = handle.loader().clone();
                        loader.update(frame);
                        match handle.signal().try_result() {
                            None => pending = true,
                            Some(Err(error)) => failed = Some(error),
                            Some(Ok(())) => components.feature_metadata = loader.metadata(),
                        }
                    }
                }

                if let Some(error) = failed {
                    self.fail_and_release(error);
                    return;
                }

                let mut inner = self.inner();
                if self.core.is_destroyed() {
                    return;
                }
                if pending {
                    inner.building = Some(components);
                    inner.metadata = metadata;
                    return;
                }
                inner.result = Some(Arc::new(components));
                inner.metadata = metadata;
                drop(inner);
                self.core.finish();
            }
            _ => {}
        }
    }

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.json = None;
            inner.building = None;
            inner.metadata = None;
            inner.result = None;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
