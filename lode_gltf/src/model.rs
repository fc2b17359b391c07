use crate::format::ComponentType;
use crate::index_buffer::IndexBufferLoader;
use crate::metadata::MetadataGltfExtension;
use crate::texture::{TextureLoader, TextureSampler};
use crate::vertex_buffer::VertexBufferLoader;
use lode_cache::cache::ResourceHandle;
use lode_cache::gpu::{GpuBuffer, GpuTexture};
use std::sync::Arc;

/// Where a vertex attribute's values come from. Accessors that declare no
/// buffer view have all-default values and carry a constant instead of a
/// loader.
pub enum AttributeSource {
    Buffer(ResourceHandle<VertexBufferLoader>),
    Constant(f32),
}

pub struct VertexAttribute {
    pub semantic: String,
    pub component_type: ComponentType,
    pub components: usize,
    pub count: usize,
    pub normalized: bool,
    pub source: AttributeSource,
    /// Populated once the loader is `Ready`.
    pub gpu: Option<GpuBuffer>,
}

pub struct Indices {
    pub loader: ResourceHandle<IndexBufferLoader>,
    pub gpu: Option<GpuBuffer>,
}

pub struct TextureRef {
    pub loader: ResourceHandle<TextureLoader>,
    pub tex_coord: u32,
    pub sampler: TextureSampler,
    pub gpu: Option<GpuTexture>,
}

/// Material texture slots across the core spec and the specular-glossiness
/// extension. Factors and scalar parameters stay with the renderer.
#[derive(Default)]
pub struct Material {
    pub base_color: Option<TextureRef>,
    pub metallic_roughness: Option<TextureRef>,
    pub diffuse: Option<TextureRef>,
    pub specular_glossiness: Option<TextureRef>,
    pub emissive: Option<TextureRef>,
    pub normal: Option<TextureRef>,
    pub occlusion: Option<TextureRef>,
}

impl Material {
    pub fn textures(&self) -> impl Iterator<Item = &TextureRef> {
        [
            self.base_color.as_ref(),
            self.metallic_roughness.as_ref(),
            self.diffuse.as_ref(),
            self.specular_glossiness.as_ref(),
            self.emissive.as_ref(),
            self.normal.as_ref(),
            self.occlusion.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn textures_mut(&mut self) -> impl Iterator<Item = &mut TextureRef> {
        [
            self.base_color.as_mut(),
            self.metallic_roughness.as_mut(),
            self.diffuse.as_mut(),
            self.specular_glossiness.as_mut(),
            self.emissive.as_mut(),
            self.normal.as_mut(),
            self.occlusion.as_mut(),
        ]
        .into_iter()
        .flatten()
    }
}

/// One morph-target displacement attribute.
pub struct MorphTarget {
    pub semantic: String,
    pub attribute: VertexAttribute,
}

/// Per-vertex feature index declared by the metadata extension. `attribute`
/// names one of the primitive's vertex attributes; when absent the ids are
/// implicit: `constant + vertex_index * divisor`.
pub struct FeatureIdAttribute {
    pub feature_table: String,
    pub attribute: Option<String>,
    pub constant: u64,
    pub divisor: u64,
}

/// Per-texel feature index declared by the metadata extension.
pub struct FeatureIdTexture {
    pub feature_table: String,
    pub channels: String,
    pub texture: TextureRef,
}

pub struct Primitive {
    pub attributes: Vec<VertexAttribute>,
    pub morph_targets: Vec<MorphTarget>,
    pub indices: Option<Indices>,
    pub material: Material,
    pub feature_id_attributes: Vec<FeatureIdAttribute>,
    pub feature_id_textures: Vec<FeatureIdTexture>,
}

pub struct Mesh {
    pub primitives: Vec<Primitive>,
}

/// Per-instance transform attributes from the GPU-instancing extension.
pub struct Instances {
    pub attributes: Vec<VertexAttribute>,
    pub count: usize,
}

pub struct Node {
    pub children: Vec<Node>,
    pub mesh: Option<Mesh>,
    pub instances: Option<Instances>,
    pub transform: glam::Mat4,
}

/// Everything a loaded model exposes to the renderer.
#[derive(Default)]
pub struct ModelComponents {
    pub scene: Vec<Node>,
    pub feature_metadata: Option<Arc<MetadataGltfExtension>>,
}

impl ModelComponents {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for node in nodes {
                out.push(node);
                walk(&node.children, out);
            }
        }
        let mut flat = Vec::new();
        walk(&self.scene, &mut flat);
        flat.into_iter()
    }
}
